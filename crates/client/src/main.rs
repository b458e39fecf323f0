use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use clap::Parser;

use mistvale::{ClientConfig, ClientState, GameClient, ServerSpec};

const TICK: Duration = Duration::from_millis(50);

#[derive(Parser)]
#[command(name = "mistvale")]
#[command(about = "Mistvale game client")]
struct Args {
    #[arg(
        long,
        help = "Add a server to the list (host[:port[:secure_port]]); repeatable"
    )]
    server: Vec<String>,

    #[arg(long, help = "Add a metaserver URL to query; repeatable")]
    metaserver: Vec<String>,

    #[arg(long, help = "Do not query the metaserver")]
    nometa: bool,

    #[arg(
        long,
        help = "Automatically connect (host[:account[:password[:character]]])"
    )]
    connect: Option<String>,

    #[arg(long, help = "Reconnect automatically after a disconnect")]
    reconnect: bool,

    #[arg(long, help = "Directory for cached server files and resources")]
    cache_dir: Option<PathBuf>,
}

/// Pieces of an `--connect` argument; empty fields are prompted for by
/// the UI layer instead.
#[derive(Default)]
struct AutoConnect {
    host: String,
    account: Option<String>,
    password: Option<String>,
    character: Option<String>,
}

fn parse_auto_connect(arg: &str) -> AutoConnect {
    let mut parts = arg.split(':');
    let host = parts.next().unwrap_or_default().to_string();
    let mut auto = AutoConnect {
        host,
        ..AutoConnect::default()
    };
    auto.account = parts.next().filter(|s| !s.is_empty()).map(String::from);
    auto.password = parts.next().filter(|s| !s.is_empty()).map(String::from);
    auto.character = parts.next().filter(|s| !s.is_empty()).map(String::from);
    auto
}

fn parse_server_spec(arg: &str) -> anyhow::Result<ServerSpec> {
    let mut parts = arg.split(':');
    let hostname = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("--server needs a hostname: {arg:?}"))?
        .to_string();
    let port = match parts.next() {
        Some(port) => port.parse()?,
        None => mistvale::DEFAULT_PORT,
    };
    let secure_port = parts.next().map(|port| port.parse::<u16>()).transpose()?;
    Ok(ServerSpec {
        hostname,
        port,
        secure_port,
    })
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();

    let mut config = ClientConfig {
        query_metaserver: !args.nometa,
        reconnect: args.reconnect,
        ..ClientConfig::default()
    };
    if !args.metaserver.is_empty() {
        config.metaserver_urls = args.metaserver.clone();
    }
    if let Some(cache_dir) = args.cache_dir {
        config.cache_dir = cache_dir;
    }
    for spec in &args.server {
        config.servers.push(parse_server_spec(spec)?);
    }

    let auto = args.connect.as_deref().map(parse_auto_connect);
    if let Some(auto) = &auto
        && !config
            .servers
            .iter()
            .any(|server| server.hostname == auto.host)
    {
        config.servers.push(ServerSpec {
            hostname: auto.host.clone(),
            port: mistvale::DEFAULT_PORT,
            secure_port: None,
        });
    }

    log::info!("starting mistvale client");
    run(GameClient::new(config), auto)
}

fn run(mut client: GameClient, auto: Option<AutoConnect>) -> anyhow::Result<()> {
    let mut last_state = client.state();
    let mut last_generation = client.directory().generation();
    let mut auto_connect_done = false;

    loop {
        client.advance();

        let state = client.state();
        if state != last_state {
            log::debug!("{:?} -> {:?}", last_state, state);
            last_state = state;
        }

        let generation = client.directory().generation();
        if generation != last_generation {
            last_generation = generation;
            print_directory(&client);
        }

        match state {
            ClientState::Idle => {
                if let Some(auto) = &auto
                    && !auto_connect_done
                    && !client.directory().is_refreshing()
                {
                    let index = client
                        .directory()
                        .iter()
                        .position(|descriptor| descriptor.hostname == auto.host);
                    match index {
                        Some(index) => {
                            auto_connect_done = true;
                            client.select_server(index)?;
                        }
                        None => {
                            anyhow::bail!("server {} is not in the directory", auto.host);
                        }
                    }
                }
            }
            ClientState::Login => {
                if let Some(AutoConnect {
                    account: Some(account),
                    password: Some(password),
                    ..
                }) = &auto
                {
                    client.submit_login(account, password);
                }
            }
            ClientState::CharacterSelect => {
                if let Some(AutoConnect {
                    character: Some(character),
                    ..
                }) = &auto
                    && client.characters().iter().any(|name| name == character)
                {
                    client.choose_character(character);
                }
            }
            ClientState::Play => {
                let stats = client.keepalive_stats();
                log::trace!(
                    "in game; ping {} ms (avg {} ms)",
                    stats.last_rtt_ms,
                    stats.avg_rtt_ms
                );
            }
            _ => {}
        }

        thread::sleep(TICK);
    }
}

fn print_directory(client: &GameClient) {
    log::info!("{} known servers:", client.directory().count());
    for descriptor in client.directory().iter() {
        log::info!(
            "  {} ({}:{}){}{}",
            descriptor.name,
            descriptor.hostname,
            descriptor.plain_port,
            if descriptor.secure_port.is_some() {
                " [secure]"
            } else {
                ""
            },
            match descriptor.players {
                Some(players) => format!(" {players} players"),
                None => String::new(),
            }
        );
    }
}
