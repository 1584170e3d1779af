#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

/// Commands whose argument is taken verbatim (model names, prompts).
pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "model",
        action: "set_text_model",
    },
    CommandSpec {
        command: "image_model",
        action: "set_image_model",
    },
    CommandSpec {
        command: "system",
        action: "set_system_prompt",
    },
    CommandSpec {
        command: "image",
        action: "generate_image",
    },
];

/// Commands whose argument is a single (possibly quoted) path.
pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "save",
    action: "save_image",
}];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "new",
        action: "reset_session",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
    },
];

pub(crate) const WEB_COMMAND: CommandSpec = CommandSpec {
    command: "web",
    action: "set_web_search",
};

pub(crate) const PARTIALS_COMMAND: CommandSpec = CommandSpec {
    command: "partials",
    action: "set_partial_images",
};

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/model",
    "/image_model",
    "/system",
    "/web",
    "/partials",
    "/image",
    "/save",
    "/new",
    "/help",
    "/quit",
];
