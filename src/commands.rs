//! Command execution.

use crate::Commands;
use colored::Colorize;
use ctlwire_client::{Client, LifecycleEvent, SendOptions};
use serde_json::Value;

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Send {
            command_type,
            payload,
            id,
        } => {
            let payload = match payload {
                Some(arg) => parse_json_arg(&arg)?,
                None => Value::Object(Default::default()),
            };
            let mut options = SendOptions::new();
            if let Some(id) = id {
                options = options.with_id(id);
            }
            let result = client.send(command_type, payload, options).await?;
            Ok(format_json(&result))
        }

        Commands::MouseMove { x, y } => {
            client.mouse_move(x, y).await?;
            Ok(format!("{} pointer to ({}, {})", "Moved".green(), x, y))
        }

        Commands::MouseClick {
            button,
            x,
            y,
            double,
        } => {
            client.mouse_click(&button, x, y, double).await?;
            let kind = if double { "Double-clicked" } else { "Clicked" };
            Ok(format!("{} {}", kind.green(), button.cyan()))
        }

        Commands::Scroll { dx, dy, at } => {
            let position = match at.as_deref() {
                Some([x, y]) => Some((*x, *y)),
                _ => None,
            };
            client.mouse_scroll(dx, dy, position).await?;
            Ok(format!("{} by ({}, {})", "Scrolled".green(), dx, dy))
        }

        Commands::KeyPress { key, modifiers } => {
            client.key_press(&key, &modifiers).await?;
            Ok(format!("{} {}", "Pressed".green(), format_key(&key, &modifiers).cyan()))
        }

        Commands::KeyRelease { key, modifiers } => {
            client.key_release(&key, &modifiers).await?;
            Ok(format!("{} {}", "Released".green(), format_key(&key, &modifiers).cyan()))
        }

        Commands::Type { text, delay } => {
            client.type_text(&text, delay).await?;
            Ok(format!("{} {} characters", "Typed".green(), text.chars().count()))
        }

        Commands::Capture {
            display,
            format,
            quality,
        } => {
            let result = client.capture_screen(display, &format, quality).await?;
            Ok(format_json(&result))
        }

        Commands::Displays => {
            let result = client.get_displays().await?;
            if result.displays.is_empty() {
                return Ok("No displays reported".yellow().to_string());
            }

            let mut output = String::new();
            for display in &result.displays {
                let primary = if display.is_primary { " (primary)" } else { "" };
                output.push_str(&format!(
                    "  [{}] {} {}x{} at ({}, {}){}\n",
                    display.id.to_string().cyan(),
                    display.name,
                    display.width,
                    display.height,
                    display.x,
                    display.y,
                    primary.yellow()
                ));
            }
            Ok(output.trim_end().to_string())
        }

        Commands::Windows => {
            let result = client.list_windows().await?;
            if result.windows.is_empty() {
                return Ok("No windows reported".yellow().to_string());
            }

            let mut output = String::new();
            for window in &result.windows {
                output.push_str(&format!(
                    "  [{:>8}] {} {} {}x{} at ({}, {})\n",
                    window.id.to_string().cyan(),
                    window.title,
                    window.process_name.dimmed(),
                    window.width,
                    window.height,
                    window.x,
                    window.y
                ));
            }
            Ok(output.trim_end().to_string())
        }

        Commands::WindowAt { x, y } => {
            let position = x.zip(y);
            let result = client.get_window_info(position).await?;
            Ok(format_json(&result))
        }

        // Watch streams events and is handled directly in main.rs
        Commands::Watch => unreachable!(),
    }
}

/// Formats a lifecycle event as one line.
pub fn format_event(event: &LifecycleEvent) -> String {
    match event {
        LifecycleEvent::StateChanged { from, to } => format!("state: {} -> {}", from, to),
        LifecycleEvent::ReconnectScheduled { attempt, delay } => {
            format!("reconnect attempt {} in {:?}", attempt, delay)
        }
        LifecycleEvent::ReconnectionExhausted { attempts } => {
            format!("reconnection exhausted after {} attempts", attempts)
        }
        LifecycleEvent::TransportError { message } => format!("transport error: {}", message),
        LifecycleEvent::ProtocolError { message } => format!("protocol error: {}", message),
    }
}

fn format_key(key: &str, modifiers: &[String]) -> String {
    if modifiers.is_empty() {
        return key.to_string();
    }
    format!("{}+{}", modifiers.join("+"), key)
}

/// Parses a JSON argument (either inline JSON or @file.json).
fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
