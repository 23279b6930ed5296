use serde::Serialize;

/// Prints results either for people or, with `--json`, one JSON object per
/// line for scripts. Logs go to stderr and never mix with either.
pub struct Output {
    json: bool,
}

impl Output {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    pub fn success<T: Serialize>(&self, command: &str, data: T) {
        if self.json {
            print_line(&Response {
                status: "ok",
                command,
                data: Some(data),
                error: None,
            });
        } else {
            match serde_json::to_string_pretty(&data) {
                Ok(text) => println!("{}", text),
                Err(e) => eprintln!("Error: failed to render output: {}", e),
            }
        }
    }

    pub fn success_message(&self, command: &str, message: &str) {
        if self.json {
            print_line(&Response {
                status: "ok",
                command,
                data: Some(serde_json::json!({ "message": message })),
                error: None,
            });
        } else {
            println!("{}", message);
        }
    }

    pub fn error(&self, message: &str) {
        if self.json {
            let response: Response<'_, ()> = Response {
                status: "error",
                command: "",
                data: None,
                error: Some(message.to_string()),
            };
            match serde_json::to_string(&response) {
                Ok(line) => eprintln!("{}", line),
                Err(_) => eprintln!("Error: {}", message),
            }
        } else {
            eprintln!("Error: {}", message);
        }
    }

    /// One item of a stream, e.g. a message printed by `listen`.
    pub fn event<T: Serialize>(&self, event: &str, data: T) {
        if self.json {
            print_line(&Event { event, data });
        } else {
            match serde_json::to_string(&data) {
                Ok(text) => println!("[{}] {}", event, text),
                Err(e) => eprintln!("Error: failed to render event: {}", e),
            }
        }
    }
}

fn print_line<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{}", line),
        Err(e) => eprintln!("Error: failed to render output: {}", e),
    }
}

#[derive(Serialize)]
struct Response<'a, T: Serialize> {
    status: &'a str,
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct Event<'a, T: Serialize> {
    event: &'a str,
    #[serde(flatten)]
    data: T,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_omits_empty_fields() {
        let response = Response {
            status: "ok",
            command: "send",
            data: Some(serde_json::json!({ "id": "m1" })),
            error: None,
        };
        assert_eq!(
            serde_json::to_string(&response).unwrap(),
            r#"{"status":"ok","command":"send","data":{"id":"m1"}}"#
        );
    }

    #[test]
    fn event_flattens_payload() {
        let event = Event {
            event: "message",
            data: serde_json::json!({ "text": "hi" }),
        };
        assert_eq!(
            serde_json::to_string(&event).unwrap(),
            r#"{"event":"message","text":"hi"}"#
        );
    }
}
