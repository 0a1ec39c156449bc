//! Static description of the console commands.
//!
//! The parser and the help renderer read the same table so keywords, aliases
//! and usage text stay in sync.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandTag {
    Show,
    Set,
    Save,
    Reset,
    NoSleep,
    Sleep,
    Reboot,
    OtaVersion,
    Status,
    Help,
}

/// Shape of the arguments that follow the keyword.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgumentSpec {
    None,
    /// One optional keyword from the list.
    OptionalKeyword(&'static [&'static str]),
    /// Setting name followed by the raw remainder of the line.
    SettingValue,
    /// Optional dotted version, or a keyword that clears the target.
    OptionalVersion,
    /// Optional command name.
    OptionalTopic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub tag: CommandTag,
    pub arguments: ArgumentSpec,
    pub usage: &'static str,
    pub summary: &'static str,
}

/// Keywords accepted after `reset`.
pub const RESET_KEYWORDS: [&str; 2] = ["nvs", "config"];

/// Keywords that clear the automatic-update target.
pub const CLEAR_TARGET_KEYWORDS: [&str; 3] = ["off", "none", "clear"];

const COMMANDS: [CommandSpec; 10] = [
    CommandSpec {
        name: "show",
        aliases: &["config"],
        tag: CommandTag::Show,
        arguments: ArgumentSpec::None,
        usage: "show",
        summary: "print the configuration with secrets masked",
    },
    CommandSpec {
        name: "set",
        aliases: &[],
        tag: CommandTag::Set,
        arguments: ArgumentSpec::SettingValue,
        usage: "set <key> <value>",
        summary: "change a setting in memory; run `save` to keep it",
    },
    CommandSpec {
        name: "save",
        aliases: &[],
        tag: CommandTag::Save,
        arguments: ArgumentSpec::None,
        usage: "save",
        summary: "persist the configuration",
    },
    CommandSpec {
        name: "reset",
        aliases: &[],
        tag: CommandTag::Reset,
        arguments: ArgumentSpec::OptionalKeyword(&RESET_KEYWORDS),
        usage: "reset [nvs]",
        summary: "erase stored configuration and restart",
    },
    CommandSpec {
        name: "nosleep",
        aliases: &["stay", "awake"],
        tag: CommandTag::NoSleep,
        arguments: ArgumentSpec::None,
        usage: "nosleep",
        summary: "disable low-power suspend and save",
    },
    CommandSpec {
        name: "sleep",
        aliases: &[],
        tag: CommandTag::Sleep,
        arguments: ArgumentSpec::None,
        usage: "sleep",
        summary: "enable low-power suspend and save",
    },
    CommandSpec {
        name: "reboot",
        aliases: &["restart"],
        tag: CommandTag::Reboot,
        arguments: ArgumentSpec::None,
        usage: "reboot",
        summary: "restart the node",
    },
    CommandSpec {
        name: "otaver",
        aliases: &[],
        tag: CommandTag::OtaVersion,
        arguments: ArgumentSpec::OptionalVersion,
        usage: "otaver [<major.minor.patch>|off]",
        summary: "show or set the automatic update target",
    },
    CommandSpec {
        name: "status",
        aliases: &[],
        tag: CommandTag::Status,
        arguments: ArgumentSpec::None,
        usage: "status",
        summary: "boot count, last reading and update state",
    },
    CommandSpec {
        name: "help",
        aliases: &[],
        tag: CommandTag::Help,
        arguments: ArgumentSpec::OptionalTopic,
        usage: "help [command]",
        summary: "list commands or describe one",
    },
];

/// Returns the full command catalog.
#[must_use]
pub const fn commands() -> &'static [CommandSpec] {
    &COMMANDS
}

/// Looks up a command by its tag.
#[must_use]
pub fn command(tag: CommandTag) -> &'static CommandSpec {
    match tag {
        CommandTag::Show => &COMMANDS[0],
        CommandTag::Set => &COMMANDS[1],
        CommandTag::Save => &COMMANDS[2],
        CommandTag::Reset => &COMMANDS[3],
        CommandTag::NoSleep => &COMMANDS[4],
        CommandTag::Sleep => &COMMANDS[5],
        CommandTag::Reboot => &COMMANDS[6],
        CommandTag::OtaVersion => &COMMANDS[7],
        CommandTag::Status => &COMMANDS[8],
        CommandTag::Help => &COMMANDS[9],
    }
}

/// Finds a command by name or alias (case insensitive).
#[must_use]
pub fn find(name: &str) -> Option<&'static CommandSpec> {
    COMMANDS.iter().find(|command| {
        command.name.eq_ignore_ascii_case(name)
            || command
                .aliases
                .iter()
                .any(|alias| alias.eq_ignore_ascii_case(name))
    })
}
