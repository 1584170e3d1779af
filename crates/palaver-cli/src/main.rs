use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use image::GenericImageView;
use palaver_contracts::chat::{parse_intent, Conversation, CHAT_HELP_COMMANDS};
use palaver_contracts::events::{new_session_id, SessionLog};
use palaver_contracts::models::{ModelRegistry, ModelSelector};
use palaver_engine::{
    clamp_partial_images, write_image_receipt, ChatTurnRequest, ChatUpdate, EngineConfig,
    ImageGenerationRequest, ImageUpdate, RelayEngine,
};
use serde_json::{json, Map, Value};

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful, concise assistant.";
const GENERATED_IMAGE_NAME: &str = "generated.png";

#[derive(Debug, Parser)]
#[command(
    name = "palaver",
    version,
    about = "Terminal chat and image generation over the OpenAI API"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive chat session with streamed replies.
    Chat(ChatArgs),
    /// One-shot image generation with streamed partial previews.
    Image(ImageArgs),
}

#[derive(Debug, Parser)]
struct ChatArgs {
    /// Directory for generated images and the session event log.
    #[arg(long, default_value = "palaver-out")]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long)]
    text_model: Option<String>,
    #[arg(long)]
    image_model: Option<String>,
    /// System instructions, resent on every turn.
    #[arg(long)]
    system: Option<String>,
    /// Ground answers with the web search tool.
    #[arg(long)]
    web: bool,
}

#[derive(Debug, Parser)]
struct ImageArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    model: Option<String>,
    /// In-progress preview frames to request (0-4).
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u64).range(0..=4))]
    partials: u64,
    #[arg(long, default_value = GENERATED_IMAGE_NAME)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("palaver error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => run_chat(args),
        Command::Image(args) => run_image(args),
    }
}

fn run_chat(args: ChatArgs) -> Result<i32> {
    let mut config = EngineConfig::from_env()?;
    if let Some(model) = args.text_model.clone() {
        config.text_model = model;
    }
    if let Some(model) = args.image_model.clone() {
        config.image_model = model;
    }
    if args.web {
        config.web_search = true;
    }

    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed to create {}", args.out.display()))?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let log = SessionLog::new(&events_path, new_session_id());
    let engine = RelayEngine::new(config, log)?;

    let registry = ModelRegistry::new(None);
    let selector = ModelSelector::new(Some(registry.clone()));

    let mut conversation = Conversation::new();
    let mut system_prompt = args
        .system
        .clone()
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
    let mut text_model = engine.config().text_model.clone();
    let mut image_model = engine.config().image_model.clone();
    let mut web_search = engine.config().web_search;
    let mut partial_images = 3u64;
    let mut last_image: Option<Vec<u8>> = None;

    engine.events().emit(
        "session_started",
        json_object(json!({
            "out_dir": args.out.to_string_lossy().to_string(),
            "text_model": text_model,
            "image_model": image_model,
        })),
    )?;

    if let Some(note) = registry_note(&registry, &text_model, "text") {
        println!("{note}");
    }

    let stdin = io::stdin();
    let mut line = String::new();

    println!("Palaver chat started. Type /help for commands.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim_end_matches(['\n', '\r']);
        let intent = parse_intent(input);
        match intent.action.as_str() {
            "noop" => continue,
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
            }
            "quit" => break,
            "set_text_model" => {
                let requested = value_as_non_empty_string(intent.command_args.get("model"));
                match requested {
                    Some(model) => {
                        if let Some(note) = registry_note(&registry, &model, "text") {
                            println!("{note}");
                        }
                        text_model = model;
                    }
                    None => match selector.select(None, "text") {
                        Ok(selection) => {
                            if let Some(reason) = selection.fallback_reason.as_deref() {
                                println!("{reason}");
                            }
                            text_model = selection.model.name;
                        }
                        Err(err) => {
                            println!("{err}");
                            continue;
                        }
                    },
                }
                println!("Text model set to {text_model}");
            }
            "set_image_model" => {
                let requested = value_as_non_empty_string(intent.command_args.get("model"));
                match requested {
                    Some(model) => {
                        if let Some(note) = registry_note(&registry, &model, "image") {
                            println!("{note}");
                        }
                        image_model = model;
                    }
                    None => match selector.select(None, "image") {
                        Ok(selection) => {
                            if let Some(reason) = selection.fallback_reason.as_deref() {
                                println!("{reason}");
                            }
                            image_model = selection.model.name;
                        }
                        Err(err) => {
                            println!("{err}");
                            continue;
                        }
                    },
                }
                println!("Image model set to {image_model}");
            }
            "set_system_prompt" => {
                if let Some(text) = value_as_non_empty_string(intent.command_args.get("text")) {
                    system_prompt = text;
                    println!("System prompt updated.");
                } else {
                    println!("/system requires the new instructions text");
                }
            }
            "set_web_search" => match intent.settings_update.get("web_search") {
                Some(Value::Bool(enabled)) => {
                    web_search = *enabled;
                    println!(
                        "Web search {}",
                        if web_search { "enabled" } else { "disabled" }
                    );
                }
                _ => println!("/web requires on or off"),
            },
            "set_partial_images" => match intent.settings_update.get("partial_images") {
                Some(Value::Number(number)) => {
                    partial_images = clamp_partial_images(number.as_u64().unwrap_or(0));
                    println!("Partial previews per image: {partial_images}");
                }
                _ => println!("/partials requires a count between 0 and 4"),
            },
            "reset_session" => {
                conversation.reset();
                engine
                    .events()
                    .emit("session_reset", json_object(json!({})))?;
                println!("Started a new chat.");
            }
            "chat" => {
                let Some(user_text) = intent.prompt.clone() else {
                    continue;
                };
                let request = ChatTurnRequest {
                    user_text,
                    instructions: system_prompt.clone(),
                    model: text_model.clone(),
                    web_search,
                };
                run_text_turn(&engine, &request, &mut conversation);
            }
            "generate_image" => {
                let Some(prompt) = value_as_non_empty_string(intent.command_args.get("prompt"))
                else {
                    println!("/image requires a prompt");
                    continue;
                };
                let request = ImageGenerationRequest {
                    prompt,
                    model: image_model.clone(),
                    partial_images,
                };
                let out_path = args.out.join(GENERATED_IMAGE_NAME);
                match run_image_generation(&engine, &request, &out_path) {
                    Ok(Some(bytes)) => last_image = Some(bytes),
                    Ok(None) => {}
                    Err(err) => println!("Image generation error: {err:#}"),
                }
            }
            "save_image" => {
                let Some(bytes) = last_image.as_deref() else {
                    println!("No image to save yet. Generate one with /image first.");
                    continue;
                };
                let path = resolve_save_path(value_as_non_empty_string(
                    intent.command_args.get("path"),
                ));
                match fs::write(&path, bytes) {
                    Ok(()) => {
                        engine.events().emit(
                            "image_saved",
                            json_object(json!({
                                "path": path.to_string_lossy().to_string(),
                                "byte_len": bytes.len(),
                            })),
                        )?;
                        println!("Saved {}", path.display());
                    }
                    Err(err) => println!("Save failed: {err}"),
                }
            }
            "unknown" => {
                let command = intent
                    .command_args
                    .get("command")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                println!("Unknown command /{command}. Type /help for commands.");
            }
            _ => {}
        }
    }

    Ok(0)
}

/// Relay one chat turn, printing deltas as they arrive and errors
/// inline in place of the reply.
fn run_text_turn(engine: &RelayEngine, request: &ChatTurnRequest, conversation: &mut Conversation) {
    print!("assistant> ");
    let _ = io::stdout().flush();

    let mut displayed = String::new();
    let result = engine.send_turn(request, conversation, &mut |update| match update {
        ChatUpdate::Delta { delta, text } => {
            print!("{delta}");
            let _ = io::stdout().flush();
            displayed = text.to_string();
        }
        ChatUpdate::StreamError { message } => {
            print!("\n[stream error: {message}]\n");
            let _ = io::stdout().flush();
        }
    });

    match result {
        Ok(Some(outcome)) => {
            if displayed.is_empty() {
                println!("{}", outcome.text);
            } else {
                // The aggregated final text can extend what streaming
                // already printed.
                if let Some(suffix) = outcome.text.strip_prefix(displayed.as_str()) {
                    if !suffix.is_empty() {
                        print!("{suffix}");
                    }
                }
                println!();
            }
        }
        // An empty exchange shows nothing and stores nothing.
        Ok(None) => println!(),
        Err(err) => println!("OpenAI error: {err:#}"),
    }
}

/// Drive one image generation, narrating frames, and write the final
/// image plus its receipt to `out_path`. Returns the final bytes, or
/// `None` for an empty outcome.
fn run_image_generation(
    engine: &RelayEngine,
    request: &ImageGenerationRequest,
    out_path: &Path,
) -> Result<Option<Vec<u8>>> {
    let outcome = engine.generate_image(request, &mut |update| match update {
        ImageUpdate::Partial { index, bytes } => {
            println!("Partial preview #{index}{}", dimensions_suffix(bytes));
        }
        ImageUpdate::Final { bytes, fallback } => {
            if fallback {
                println!("Final image (from last partial){}", dimensions_suffix(bytes));
            } else {
                println!("Final image{}", dimensions_suffix(bytes));
            }
        }
        ImageUpdate::StreamError { message } => {
            println!("Image generation error: {message}");
        }
    })?;

    let Some(bytes) = outcome.bytes.clone() else {
        println!("No image bytes received. Try again.");
        return Ok(None);
    };

    if let Some(parent) = out_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::write(out_path, &bytes)
        .with_context(|| format!("failed to write {}", out_path.display()))?;
    let receipt_path = write_image_receipt(out_path, request, &outcome, probe_dimensions(&bytes))?;
    println!(
        "Saved {} ({} bytes); receipt at {}",
        out_path.display(),
        bytes.len(),
        receipt_path.display()
    );
    Ok(Some(bytes))
}

fn run_image(args: ImageArgs) -> Result<i32> {
    let mut config = EngineConfig::from_env()?;
    if let Some(model) = args.model.clone() {
        config.image_model = model;
    }
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| PathBuf::from("events.jsonl"));
    let log = SessionLog::new(&events_path, new_session_id());
    let engine = RelayEngine::new(config, log)?;

    let request = ImageGenerationRequest {
        prompt: args.prompt.clone(),
        model: engine.config().image_model.clone(),
        partial_images: args.partials,
    };
    run_image_generation(&engine, &request, &args.out)?;
    Ok(0)
}

fn resolve_save_path(requested: Option<String>) -> PathBuf {
    requested
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(GENERATED_IMAGE_NAME))
}

fn registry_note(registry: &ModelRegistry, model: &str, capability: &str) -> Option<String> {
    if registry.get(model).is_none() {
        return Some(format!(
            "Note: '{model}' is not in the local registry; relaying as-is."
        ));
    }
    if registry.ensure(model, capability).is_none() {
        return Some(format!(
            "Note: '{model}' is not registered for {capability} use."
        ));
    }
    None
}

fn probe_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::load_from_memory(bytes)
        .ok()
        .map(|img| img.dimensions())
}

fn dimensions_suffix(bytes: &[u8]) -> String {
    probe_dimensions(bytes)
        .map(|(width, height)| format!(" ({width}x{height})"))
        .unwrap_or_default()
}

fn value_as_non_empty_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn json_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::path::PathBuf;

    use palaver_contracts::models::ModelRegistry;

    use super::{
        dimensions_suffix, probe_dimensions, registry_note, resolve_save_path,
        value_as_non_empty_string, GENERATED_IMAGE_NAME,
    };

    fn one_by_one_png() -> Vec<u8> {
        let mut bytes = Vec::new();
        image::DynamicImage::ImageRgba8(image::RgbaImage::new(1, 1))
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    #[test]
    fn save_path_defaults_to_the_fixed_download_name() {
        assert_eq!(
            resolve_save_path(None),
            PathBuf::from(GENERATED_IMAGE_NAME)
        );
        assert_eq!(
            resolve_save_path(Some("/tmp/final.png".to_string())),
            PathBuf::from("/tmp/final.png")
        );
    }

    #[test]
    fn dimensions_suffix_reads_decodable_frames_only() {
        assert_eq!(dimensions_suffix(&one_by_one_png()), " (1x1)");
        assert_eq!(dimensions_suffix(b"not an image"), "");
        assert_eq!(probe_dimensions(b""), None);
    }

    #[test]
    fn registry_note_flags_unknown_and_mismatched_models() {
        let registry = ModelRegistry::new(None);
        assert!(registry_note(&registry, "gpt-5", "text").is_none());
        assert!(registry_note(&registry, "made-up-model", "text").is_some());
        assert!(registry_note(&registry, "gpt-image-1", "text").is_some());
    }

    #[test]
    fn non_empty_string_extraction_trims_and_rejects_blank() {
        let value = serde_json::json!("  hello  ");
        assert_eq!(
            value_as_non_empty_string(Some(&value)),
            Some("hello".to_string())
        );
        let blank = serde_json::json!("   ");
        assert_eq!(value_as_non_empty_string(Some(&blank)), None);
        assert_eq!(value_as_non_empty_string(None), None);
    }
}
