mod session;
mod sim;

use std::env;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process;

use node_core::version::FirmwareVersion;
use session::{Session, SessionOptions};

const DEFAULT_STATE_DIR: &str = "node-state";
const DEFAULT_FIRMWARE: FirmwareVersion = FirmwareVersion::new(1, 2, 0);
const USAGE: &str =
    "Usage: node-emulator [--state-dir <dir>] [--transcript <file>] [--version <x.y.z>]";

fn main() -> io::Result<()> {
    env_logger::init();

    let options = parse_options(env::args().skip(1)).unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("{USAGE}");
        process::exit(2);
    });

    let mut session = Session::new(options)?;
    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let mut writer = io::stdout().lock();
    writeln!(writer, "{}", session.banner())?;

    let mut line = String::new();
    loop {
        line.clear();
        write!(writer, "{}", session.prompt())?;
        writer.flush()?;

        let input = if reader.read_line(&mut line)? == 0 {
            // End of input closes the session like `exit`.
            writeln!(writer)?;
            "exit"
        } else {
            line.as_str()
        };

        let reply = session.handle_command(input)?;
        for response in &reply.lines {
            writeln!(writer, "{response}")?;
        }
        if reply.close {
            return Ok(());
        }
    }
}

fn parse_options<I>(args: I) -> Result<SessionOptions, String>
where
    I: IntoIterator<Item = String>,
{
    let mut options = SessionOptions {
        state_dir: PathBuf::from(DEFAULT_STATE_DIR),
        transcript: None,
        firmware: DEFAULT_FIRMWARE,
    };

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_owned(), Some(value.to_owned())),
            None => (arg, None),
        };
        let mut value = || {
            inline
                .clone()
                .or_else(|| args.next())
                .ok_or_else(|| format!("Expected value after {flag}"))
        };

        match flag.as_str() {
            "--state-dir" => options.state_dir = PathBuf::from(value()?),
            "--transcript" => options.transcript = Some(PathBuf::from(value()?)),
            "--version" => {
                let text = value()?;
                options.firmware = FirmwareVersion::parse(&text)
                    .map_err(|err| format!("Invalid firmware version `{text}`: {err}"))?;
            }
            other => return Err(format!("Unknown argument `{other}`")),
        }
    }

    Ok(options)
}
