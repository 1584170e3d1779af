use serde_json::Value;

pub const TEXT_DELTA_EVENT_KIND: &str = "response.output_text.delta";
pub const PARTIAL_IMAGE_EVENT_KIND: &str = "image_generation.partial_image";

/// Event kinds the Images API has used for the final frame. Older API
/// revisions shipped several synonyms; extend this set rather than
/// renaming members.
pub const FINAL_IMAGE_EVENT_KINDS: &[&str] = &[
    "image_generation.completed",
    "image_generation.image",
    "image.image",
    "image.completed",
    "response.image_generation_call.completed",
];

/// One classified event from a streamed text-generation call.
#[derive(Debug, Clone, PartialEq)]
pub enum TextStreamEvent {
    Delta { delta: String },
    Completed { response: Value },
    Error { message: String },
    Other { kind: String },
}

impl TextStreamEvent {
    pub fn classify(event: &Value) -> Self {
        let kind = event_kind(event);
        if kind == TEXT_DELTA_EVENT_KIND {
            let delta = event
                .get("delta")
                .and_then(Value::as_str)
                .or_else(|| event.get("text").and_then(Value::as_str))
                .unwrap_or_default();
            return Self::Delta {
                delta: delta.to_string(),
            };
        }
        if kind == "response.completed" || kind == "response.done" {
            return Self::Completed {
                response: event.get("response").cloned().unwrap_or(Value::Null),
            };
        }
        if is_error_kind(&kind) || kind == "response.failed" {
            return Self::Error {
                message: error_message(event),
            };
        }
        Self::Other { kind }
    }
}

/// One classified event from a streamed image-generation call.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageStreamEvent {
    Partial { b64: String },
    Completed { b64: String },
    Error { message: String },
    Other { kind: String },
}

impl ImageStreamEvent {
    pub fn classify(event: &Value) -> Self {
        let kind = event_kind(event);
        if kind == PARTIAL_IMAGE_EVENT_KIND {
            if let Some(b64) = b64_payload(event) {
                return Self::Partial { b64 };
            }
            return Self::Other { kind };
        }
        if FINAL_IMAGE_EVENT_KINDS.contains(&kind.as_str()) {
            if let Some(b64) = b64_payload(event) {
                return Self::Completed { b64 };
            }
            // A terminal kind without bytes is ignored; the last-partial
            // fallback covers it.
            return Self::Other { kind };
        }
        if is_error_kind(&kind) {
            return Self::Error {
                message: error_message(event),
            };
        }
        Self::Other { kind }
    }
}

fn event_kind(event: &Value) -> String {
    event
        .get("type")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

fn is_error_kind(kind: &str) -> bool {
    kind == "error" || kind.ends_with(".error")
}

fn b64_payload(event: &Value) -> Option<String> {
    event
        .get("b64_json")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn error_message(event: &Value) -> String {
    let Some(error) = event.get("error") else {
        return "API stream error.".to_string();
    };
    if let Some(text) = error
        .as_str()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return text.to_string();
    }
    let Some(object) = error.as_object() else {
        return "API stream error.".to_string();
    };
    let message = object
        .get("message")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or("API stream error.");
    let kind = object
        .get("type")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or_default();
    let code = object
        .get("code")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or_default();
    let prefix = [kind, code]
        .iter()
        .filter(|value| !value.is_empty())
        .cloned()
        .collect::<Vec<&str>>()
        .join(" ");
    if prefix.is_empty() {
        message.to_string()
    } else {
        format!("{prefix}: {message}")
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ImageStreamEvent, TextStreamEvent, FINAL_IMAGE_EVENT_KINDS};

    #[test]
    fn text_delta_reads_delta_field() {
        let event = json!({"type": "response.output_text.delta", "delta": "Hel"});
        assert_eq!(
            TextStreamEvent::classify(&event),
            TextStreamEvent::Delta {
                delta: "Hel".to_string()
            }
        );
    }

    #[test]
    fn text_delta_falls_back_to_text_field() {
        let event = json!({"type": "response.output_text.delta", "text": "lo"});
        assert_eq!(
            TextStreamEvent::classify(&event),
            TextStreamEvent::Delta {
                delta: "lo".to_string()
            }
        );
    }

    #[test]
    fn text_completed_carries_the_response_object() {
        let event = json!({
            "type": "response.completed",
            "response": {"id": "resp_9", "output_text": "done"}
        });
        let TextStreamEvent::Completed { response } = TextStreamEvent::classify(&event) else {
            panic!("expected completed");
        };
        assert_eq!(response["id"], json!("resp_9"));

        let done = json!({"type": "response.done", "response": {"id": "resp_10"}});
        assert!(matches!(
            TextStreamEvent::classify(&done),
            TextStreamEvent::Completed { .. }
        ));
    }

    #[test]
    fn text_error_kinds_surface_a_message() {
        let event = json!({
            "type": "response.error",
            "error": {"type": "server_error", "code": "overloaded", "message": "try later"}
        });
        assert_eq!(
            TextStreamEvent::classify(&event),
            TextStreamEvent::Error {
                message: "server_error overloaded: try later".to_string()
            }
        );

        let failed = json!({"type": "response.failed", "error": {"message": "nope"}});
        assert_eq!(
            TextStreamEvent::classify(&failed),
            TextStreamEvent::Error {
                message: "nope".to_string()
            }
        );
    }

    #[test]
    fn unknown_text_kinds_fall_through() {
        let event = json!({"type": "response.output_item.added"});
        assert_eq!(
            TextStreamEvent::classify(&event),
            TextStreamEvent::Other {
                kind: "response.output_item.added".to_string()
            }
        );
    }

    #[test]
    fn image_partial_carries_base64_payload() {
        let event = json!({"type": "image_generation.partial_image", "b64_json": "QUJD"});
        assert_eq!(
            ImageStreamEvent::classify(&event),
            ImageStreamEvent::Partial {
                b64: "QUJD".to_string()
            }
        );
    }

    #[test]
    fn every_terminal_synonym_classifies_as_completed() {
        for kind in FINAL_IMAGE_EVENT_KINDS {
            let event = json!({"type": kind, "b64_json": "QUJD"});
            assert_eq!(
                ImageStreamEvent::classify(&event),
                ImageStreamEvent::Completed {
                    b64: "QUJD".to_string()
                },
                "kind {kind} should be terminal"
            );
        }
    }

    #[test]
    fn terminal_kind_without_bytes_is_ignored() {
        let event = json!({"type": "image_generation.completed"});
        assert_eq!(
            ImageStreamEvent::classify(&event),
            ImageStreamEvent::Other {
                kind: "image_generation.completed".to_string()
            }
        );
    }

    #[test]
    fn image_error_matches_bare_and_suffixed_kinds() {
        let bare = json!({"type": "error", "error": {"message": "bad prompt"}});
        assert_eq!(
            ImageStreamEvent::classify(&bare),
            ImageStreamEvent::Error {
                message: "bad prompt".to_string()
            }
        );

        let suffixed = json!({"type": "image_generation.error", "error": "quota"});
        assert_eq!(
            ImageStreamEvent::classify(&suffixed),
            ImageStreamEvent::Error {
                message: "quota".to_string()
            }
        );

        let empty = json!({"type": "error"});
        assert_eq!(
            ImageStreamEvent::classify(&empty),
            ImageStreamEvent::Error {
                message: "API stream error.".to_string()
            }
        );
    }

    #[test]
    fn unknown_image_kinds_are_ignored_quietly() {
        let event = json!({"type": "image_generation.queued"});
        assert_eq!(
            ImageStreamEvent::classify(&event),
            ImageStreamEvent::Other {
                kind: "image_generation.queued".to_string()
            }
        );
    }
}
