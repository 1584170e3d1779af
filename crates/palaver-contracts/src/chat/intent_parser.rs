use std::collections::BTreeMap;

use serde_json::Value;

use super::command_registry::{
    CommandSpec, NO_ARG_COMMANDS, PARTIALS_COMMAND, RAW_ARG_COMMANDS, SINGLE_PATH_COMMANDS,
    WEB_COMMAND,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Intent {
    pub action: String,
    pub raw: String,
    pub prompt: Option<String>,
    pub settings_update: BTreeMap<String, Value>,
    pub command_args: BTreeMap<String, Value>,
}

impl Intent {
    fn new(action: &str, raw: &str) -> Self {
        Self {
            action: action.to_string(),
            raw: raw.to_string(),
            prompt: None,
            settings_update: BTreeMap::new(),
            command_args: BTreeMap::new(),
        }
    }
}

fn find_action(command: &str, specs: &[CommandSpec]) -> Option<&'static str> {
    specs
        .iter()
        .find(|spec| spec.command == command)
        .map(|spec| spec.action)
}

fn raw_arg_key(action: &str) -> &'static str {
    match action {
        "set_system_prompt" => "text",
        "generate_image" => "prompt",
        _ => "model",
    }
}

fn parse_path_args(arg: &str) -> Vec<String> {
    if arg.trim().is_empty() {
        return Vec::new();
    }
    match shell_words::split(arg) {
        Ok(parts) => parts
            .into_iter()
            .filter(|value| !value.is_empty())
            .collect(),
        Err(_) => arg
            .split_whitespace()
            .map(str::to_string)
            .filter(|value| !value.is_empty())
            .collect(),
    }
}

fn parse_single_path_arg(arg: &str) -> String {
    let parts = parse_path_args(arg);
    match parts.len() {
        0 => String::new(),
        1 => parts[0].clone(),
        _ => parts.join(" "),
    }
}

fn parse_web_toggle(arg: &str) -> Option<bool> {
    match arg.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => Some(true),
        "off" | "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

pub fn parse_intent(text: &str) -> Intent {
    let raw_trimmed = text.trim();
    if raw_trimmed.is_empty() {
        return Intent::new("noop", text);
    }

    if let Some(slash_tail) = raw_trimmed.strip_prefix('/') {
        let command_len = slash_tail
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if command_len > 0 {
            let command = slash_tail[..command_len].to_ascii_lowercase();
            let remainder = &slash_tail[command_len..];
            let arg = if remainder.is_empty() {
                ""
            } else {
                remainder.trim()
            };

            if let Some(action) = find_action(&command, RAW_ARG_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent
                    .command_args
                    .insert(raw_arg_key(action).to_string(), Value::String(arg.to_string()));
                return intent;
            }

            if command == WEB_COMMAND.command {
                let mut intent = Intent::new(WEB_COMMAND.action, text);
                intent.settings_update.insert(
                    "web_search".to_string(),
                    parse_web_toggle(arg).map(Value::Bool).unwrap_or(Value::Null),
                );
                return intent;
            }

            if command == PARTIALS_COMMAND.command {
                let mut intent = Intent::new(PARTIALS_COMMAND.action, text);
                intent.settings_update.insert(
                    "partial_images".to_string(),
                    arg.parse::<u64>()
                        .ok()
                        .map(|value| Value::Number(value.into()))
                        .unwrap_or(Value::Null),
                );
                return intent;
            }

            if let Some(action) = find_action(&command, SINGLE_PATH_COMMANDS) {
                let mut intent = Intent::new(action, text);
                intent.command_args.insert(
                    "path".to_string(),
                    Value::String(parse_single_path_arg(arg)),
                );
                return intent;
            }

            if let Some(action) = find_action(&command, NO_ARG_COMMANDS) {
                return Intent::new(action, text);
            }

            let mut intent = Intent::new("unknown", text);
            intent
                .command_args
                .insert("command".to_string(), Value::String(command));
            intent
                .command_args
                .insert("arg".to_string(), Value::String(arg.to_string()));
            return intent;
        }
    }

    let mut intent = Intent::new("chat", text);
    intent.prompt = Some(raw_trimmed.to_string());
    intent
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_intent;

    #[test]
    fn plain_text_is_a_chat_turn() {
        let intent = parse_intent("  what is the capital of France?  ");
        assert_eq!(intent.action, "chat");
        assert_eq!(
            intent.prompt.as_deref(),
            Some("what is the capital of France?")
        );
    }

    #[test]
    fn empty_input_is_a_noop() {
        assert_eq!(parse_intent("   ").action, "noop");
        assert_eq!(parse_intent("").action, "noop");
    }

    #[test]
    fn parse_model_commands() {
        let text_model = parse_intent("/model gpt-5");
        assert_eq!(text_model.action, "set_text_model");
        assert_eq!(text_model.command_args["model"], json!("gpt-5"));

        let image_model = parse_intent("/image_model gpt-image-1");
        assert_eq!(image_model.action, "set_image_model");
        assert_eq!(image_model.command_args["model"], json!("gpt-image-1"));
    }

    #[test]
    fn parse_system_prompt_keeps_the_argument_verbatim() {
        let intent = parse_intent("/system You are a helpful, concise assistant.");
        assert_eq!(intent.action, "set_system_prompt");
        assert_eq!(
            intent.command_args["text"],
            json!("You are a helpful, concise assistant.")
        );
    }

    #[test]
    fn parse_image_command_takes_the_whole_prompt() {
        let intent = parse_intent("/image a river made of white owl feathers");
        assert_eq!(intent.action, "generate_image");
        assert_eq!(
            intent.command_args["prompt"],
            json!("a river made of white owl feathers")
        );
    }

    #[test]
    fn parse_web_toggle_accepts_on_off_spellings() {
        assert_eq!(
            parse_intent("/web on").settings_update["web_search"],
            json!(true)
        );
        assert_eq!(
            parse_intent("/web OFF").settings_update["web_search"],
            json!(false)
        );
        assert_eq!(
            parse_intent("/web maybe").settings_update["web_search"],
            json!(null)
        );
    }

    #[test]
    fn parse_partials_bounds_are_left_to_the_caller() {
        assert_eq!(
            parse_intent("/partials 3").settings_update["partial_images"],
            json!(3)
        );
        assert_eq!(
            parse_intent("/partials many").settings_update["partial_images"],
            json!(null)
        );
    }

    #[test]
    fn parse_save_quoted_path() {
        let intent = parse_intent("/save \"/tmp/out dir/final.png\"");
        assert_eq!(intent.action, "save_image");
        assert_eq!(intent.command_args["path"], json!("/tmp/out dir/final.png"));

        let bare = parse_intent("/save");
        assert_eq!(bare.command_args["path"], json!(""));
    }

    #[test]
    fn parse_no_arg_commands() {
        assert_eq!(parse_intent("/new").action, "reset_session");
        assert_eq!(parse_intent("/help").action, "help");
        assert_eq!(parse_intent("/quit").action, "quit");
        assert_eq!(parse_intent("/exit").action, "quit");
    }

    #[test]
    fn parse_unknown_command() {
        let intent = parse_intent("/magic foo bar");
        assert_eq!(intent.action, "unknown");
        assert_eq!(intent.command_args["command"], json!("magic"));
        assert_eq!(intent.command_args["arg"], json!("foo bar"));
    }
}
