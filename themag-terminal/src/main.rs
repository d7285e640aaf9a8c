use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use themag_terminal::keys::Key;
use themag_terminal::vfs::{self, FileNode};
use themag_terminal::{
    AgentClient, ScratchDirRuntime, StdoutSurface, Surface, TerminalController, TerminalMode,
    DEFAULT_AGENT_URL, DEFAULT_ORIGIN,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "TheMAG terminal: simulated, sandboxed or remote shell", long_about = None)]
struct Cli {
    #[arg(
        long,
        env = "THEMAG_AGENT_URL",
        default_value = DEFAULT_AGENT_URL,
        help = "WebSocket address of the local agent"
    )]
    agent_url: String,

    #[arg(
        long,
        default_value = DEFAULT_ORIGIN,
        help = "Origin announced to the agent during the handshake"
    )]
    origin: String,

    #[arg(
        long,
        help = "Initial mode: simulated, sandboxed or remote"
    )]
    mode: Option<TerminalMode>,

    #[arg(
        long,
        value_name = "DIR",
        help = "Scratch directory backing sandboxed mode (disabled when absent)"
    )]
    sandbox_root: Option<PathBuf>,

    #[arg(
        long,
        value_name = "FILE",
        help = "JSON file with the simulated workspace tree"
    )]
    workspace: Option<PathBuf>,

    #[arg(long, help = "Shell used for sandboxed commands instead of sh / cmd.exe")]
    shell: Option<String>,

    #[arg(long, help = "Connect to the agent on startup")]
    connect: bool,
}

impl Cli {
    fn initial_mode(&self) -> TerminalMode {
        match (self.mode, &self.sandbox_root) {
            (Some(mode), _) => mode,
            (None, Some(_)) => TerminalMode::Sandboxed,
            (None, None) => TerminalMode::Simulated,
        }
    }

    fn load_workspace(&self) -> anyhow::Result<Vec<FileNode>> {
        let Some(path) = &self.workspace else {
            return Ok(vfs::sample_workspace());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read workspace {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid workspace tree in {}", path.display()))
    }
}

/// Commands addressed to the terminal itself rather than to a backend.
#[derive(Debug, PartialEq, Eq)]
enum Meta<'a> {
    Mode(&'a str),
    Connect(Option<&'a str>),
    Disconnect,
    Kill,
    Clear,
    Quit,
    Unknown(&'a str),
}

fn parse_meta(line: &str) -> Option<Meta<'_>> {
    let rest = line.trim().strip_prefix(':')?;
    let mut parts = rest.split_whitespace();
    let meta = match parts.next().unwrap_or_default() {
        "mode" => Meta::Mode(parts.next().unwrap_or_default()),
        "connect" => Meta::Connect(parts.next()),
        "disconnect" => Meta::Disconnect,
        "kill" => Meta::Kill,
        "clear" => Meta::Clear,
        "quit" | "q" | "exit" => Meta::Quit,
        other => Meta::Unknown(other),
    };
    Some(meta)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let tree = cli.load_workspace()?;
    let sandbox = match &cli.sandbox_root {
        Some(root) => {
            std::fs::create_dir_all(root)
                .with_context(|| format!("failed to create sandbox root {}", root.display()))?;
            ScratchDirRuntime::new(root)
        }
        None => ScratchDirRuntime::unavailable(),
    }
    .with_shell(cli.shell.clone());

    let surface: Arc<dyn Surface> = Arc::new(StdoutSurface);
    let client = AgentClient::new();
    {
        let surface = Arc::clone(&surface);
        client.on_status(move |status| {
            surface.write(&format!("\r\n\x1b[90m[agent {status}]\x1b[0m"));
        });
    }

    let mut term = TerminalController::new(surface.clone(), client.clone(), Arc::new(sandbox), tree)
        .with_echo(false);
    term.banner();

    if cli.connect {
        if let Err(err) = client.connect(&cli.agent_url, &cli.origin).await {
            surface.writeln(&format!("\r\n\x1b[31m{err}\x1b[0m"));
        }
    }
    let initial = cli.initial_mode();
    if initial != TerminalMode::Simulated {
        if let Err(err) = term.switch_mode(initial).await {
            debug!(%err, "initial mode not available");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => match line.context("failed to read stdin")? {
                Some(line) => line,
                None => break,
            },
            interrupted = tokio::signal::ctrl_c() => {
                interrupted.context("failed to listen for Ctrl-C")?;
                term.handle_key(Key::Interrupt).await.ok();
                continue;
            }
        };

        let result = match parse_meta(&line) {
            Some(Meta::Quit) => break,
            Some(Meta::Mode(name)) => match name.parse::<TerminalMode>() {
                Ok(mode) => term.switch_mode(mode).await,
                Err(err) => {
                    surface.writeln(&format!("\r\n\x1b[31m{err}\x1b[0m"));
                    term.prompt();
                    Ok(())
                }
            },
            Some(Meta::Connect(url)) => {
                let url = url.unwrap_or(&cli.agent_url);
                if let Err(err) = client.connect(url, &cli.origin).await {
                    surface.writeln(&format!("\r\n\x1b[31m{err}\x1b[0m"));
                }
                term.prompt();
                Ok(())
            }
            Some(Meta::Disconnect) => {
                client.disconnect();
                term.prompt();
                Ok(())
            }
            Some(Meta::Kill) => term.handle_key(Key::Interrupt).await,
            Some(Meta::Clear) => term.handle_key(Key::ClearScreen).await,
            Some(Meta::Unknown(name)) => {
                surface.writeln(&format!(
                    "\r\n\x1b[31mUnknown terminal command :{name}\x1b[0m"
                ));
                surface.writeln(
                    "\x1b[90m:mode <simulated|sandboxed|remote>  :connect [url]  :disconnect  :kill  :clear  :quit\x1b[0m",
                );
                term.prompt();
                Ok(())
            }
            None => term.handle_input(&format!("{line}\r")).await,
        };
        if let Err(err) = result {
            debug!(%err, "terminal command failed");
        }
    }

    client.disconnect();
    surface.writeln("");
    Ok(())
}
