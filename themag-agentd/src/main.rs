use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use themag_agentd::{run, Settings, DEFAULT_PRIMARY_DOMAIN};
use themag_protocol::AGENT_PORT_ENV;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "TheMAG local agent: origin-gated shell bridge", long_about = None)]
struct Cli {
    #[arg(
        long,
        default_value = "127.0.0.1:4477",
        help = "Listen address for the WebSocket bridge"
    )]
    listen: SocketAddr,

    #[arg(
        long,
        env = AGENT_PORT_ENV,
        help = "Override only the port of --listen"
    )]
    port: Option<u16>,

    #[arg(
        long,
        value_name = "PATH",
        help = "Initial working directory of new sessions (defaults to the current directory)"
    )]
    workdir: Option<PathBuf>,

    #[arg(
        long,
        default_value = DEFAULT_PRIMARY_DOMAIN,
        help = "Domain whose origins (and subdomains) may connect, on any scheme or port"
    )]
    primary_domain: String,

    #[arg(
        long,
        conflicts_with = "primary_domain",
        help = "Accept only loopback and explicitly allowed origins"
    )]
    no_primary_domain: bool,

    #[arg(
        long = "allow-origin",
        value_name = "ORIGIN",
        env = "THEMAG_AGENT_ALLOWED_ORIGINS",
        value_delimiter = ',',
        help = "Additional origin allowed to connect, e.g. https://studio.example.com"
    )]
    allow_origins: Vec<String>,

    #[arg(long, help = "Shell used to run commands instead of sh / cmd.exe")]
    shell: Option<String>,

    #[arg(
        long,
        help = "OTLP endpoint for metrics export (e.g., http://localhost:4318)"
    )]
    otlp_endpoint: Option<String>,
}

impl Cli {
    fn into_settings(self) -> Settings {
        let mut listen = self.listen;
        if let Some(port) = self.port {
            listen.set_port(port);
        }
        Settings {
            listen,
            workdir: self.workdir,
            primary_domain: (!self.no_primary_domain).then_some(self.primary_domain),
            allowed_origins: self.allow_origins,
            shell: self.shell,
            otlp_endpoint: self.otlp_endpoint,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    run(cli.into_settings()).await
}
