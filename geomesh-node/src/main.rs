mod logger;
mod udp;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{fs, process};

use anyhow::Context as _;
use localtime::LocalDuration;
use serde::Deserialize;

use geomesh::message::Entity;
use geomesh::node::{self, MeshNode};
use geomesh::tracker;

use crate::udp::UdpTransport;

pub const NAME: &str = "geomesh-node";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const HELP_MSG: &str = r#"
Usage

   geomesh-node --address <address> [<option>...]

   Joins a spatial mesh over UDP. The advertised address is how peers
   reach this node; use `--listen` when binding a wildcard socket, eg.
   `--address udp://192.168.1.7:11511 --listen udp://0.0.0.0:11511`.

Options

    --config        <path>       Profile file to use (JSON)
    --address       <address>    Advertised endpoint, eg. udp://127.0.0.1:11511
    --listen        <address>    Bind address (default: 0.0.0.0 at the advertised port)
    --name          <label>      Node label
    --coordinates   <x,y,..>     Position in the mesh coordinate space
    --latch         <address>    Bootstrap peer; may be repeated
    --spectator                  Monitor role: forward nothing
    --announce      <name>       Periodically publish own position as an entity
    --version                    Print program version
    --help                       Print help
"#;

/// On-disk node profile. Command-line flags override it.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct Profile {
    name: String,
    address: String,
    listen: Option<String>,
    coordinates: Vec<f32>,
    power_radius: f32,
    group_mask: Option<u32>,
    tracking_duration: Option<u32>,
    /// Milliseconds.
    peer_update_interval: Option<u64>,
    /// Milliseconds.
    entity_expiry_interval: Option<u64>,
    entity_updates_size: Option<usize>,
    timestamp_lookup_size: Option<usize>,
    spectator: bool,
    latch: Vec<String>,
}

impl Profile {
    fn load(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("couldn't read profile `{}`", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("couldn't parse profile `{}`", path.display()))
    }
}

#[derive(Debug, Default)]
struct Options {
    config: Option<PathBuf>,
    name: Option<String>,
    address: Option<String>,
    listen: Option<String>,
    coordinates: Option<Vec<f32>>,
    latch: Vec<String>,
    spectator: bool,
    announce: Option<String>,
}

impl Options {
    fn from_env() -> Result<Self, anyhow::Error> {
        use lexopt::prelude::*;

        let mut parser = lexopt::Parser::from_env();
        let mut options = Options::default();

        while let Some(arg) = parser.next()? {
            match arg {
                Long("config") => {
                    options.config = Some(PathBuf::from(parser.value()?));
                }
                Long("name") => {
                    options.name = Some(parser.value()?.string()?);
                }
                Long("address") => {
                    options.address = Some(parser.value()?.string()?);
                }
                Long("listen") => {
                    options.listen = Some(parser.value()?.string()?);
                }
                Long("coordinates") => {
                    let value = parser.value()?.string()?;
                    let coordinates = value
                        .split(',')
                        .map(|c| c.trim().parse())
                        .collect::<Result<Vec<f32>, _>>()
                        .context("invalid --coordinates")?;
                    options.coordinates = Some(coordinates);
                }
                Long("latch") => {
                    options.latch.push(parser.value()?.string()?);
                }
                Long("spectator") => {
                    options.spectator = true;
                }
                Long("announce") => {
                    options.announce = Some(parser.value()?.string()?);
                }
                Long("help") | Short('h') => {
                    println!("{HELP_MSG}");
                    process::exit(0);
                }
                Long("version") => {
                    println!("{NAME} {VERSION}");
                    process::exit(0);
                }
                _ => anyhow::bail!(arg.unexpected()),
            }
        }
        Ok(options)
    }
}

/// Default bind address: every interface, at the advertised port.
fn default_listen(address: &str) -> anyhow::Result<String> {
    let port = address
        .rsplit_once(':')
        .map(|(_, port)| port)
        .context("advertised address carries no port")?;
    Ok(format!("{}0.0.0.0:{port}", udp::SCHEME))
}

fn execute() -> anyhow::Result<()> {
    logger::init(logger::env_level().unwrap_or(log::Level::Info))?;

    let options = Options::from_env()?;
    let mut profile = match &options.config {
        Some(path) => Profile::load(path)?,
        None => Profile::default(),
    };
    if let Some(name) = options.name {
        profile.name = name;
    }
    if let Some(address) = options.address {
        profile.address = address;
    }
    if let Some(listen) = options.listen {
        profile.listen = Some(listen);
    }
    if let Some(coordinates) = options.coordinates {
        profile.coordinates = coordinates;
    }
    profile.latch.extend(options.latch);
    profile.spectator |= options.spectator;

    anyhow::ensure!(!profile.address.is_empty(), "an --address is required");

    let listen = match &profile.listen {
        Some(listen) => listen.clone(),
        None => default_listen(&profile.address)?,
    };
    log::info!(target: "node", "Starting {NAME} {VERSION}..");
    log::info!(target: "node", "Listening on {listen}, advertising {}", profile.address);

    let transport = Arc::new(UdpTransport::bind(&listen).context("couldn't bind socket")?);
    let peer_update_interval =
        LocalDuration::from_millis(profile.peer_update_interval.unwrap_or(1000).into());
    let mut config = node::Config::new(
        tracker::Config {
            name: profile.name.clone(),
            address: profile.address.clone(),
            coordinates: profile.coordinates.clone(),
            power_radius: profile.power_radius,
            group_mask: profile.group_mask.unwrap_or(u32::MAX),
            tracking_duration: profile.tracking_duration.unwrap_or(u32::MAX),
        },
        transport,
    );
    config.peer_update_interval = peer_update_interval;
    if let Some(interval) = profile.entity_expiry_interval {
        config.entity_expiry_interval = LocalDuration::from_millis(interval.into());
    }
    if let Some(size) = profile.entity_updates_size {
        config.entity_updates_size = size;
    }
    if let Some(size) = profile.timestamp_lookup_size {
        config.ego_sphere.timestamp_lookup_size = size;
    }
    config.spectator = profile.spectator;

    let node = MeshNode::new(config).context("couldn't start mesh node")?;
    for address in &profile.latch {
        match node.peer_tracker().latch(address, u32::MAX) {
            Ok(()) => log::info!(target: "node", "Latched bootstrap peer {address}"),
            Err(e) => log::warn!(target: "node", "Couldn't latch {address}: {e}"),
        }
    }

    let announce_interval = Duration::from_millis(peer_update_interval.as_millis() as u64);
    let mut announced = Instant::now();
    loop {
        node.poll(LocalDuration::from_millis(100))
            .context("transport poll failed")?;

        if let Some(name) = &options.announce {
            if announced.elapsed() >= announce_interval {
                announced = Instant::now();
                let mut entities = [Entity {
                    name: name.clone(),
                    coordinates: profile.coordinates.clone(),
                    // Relative: rebased onto mesh time below.
                    expiry: 3 * announce_interval.as_nanos() as i64,
                    ..Entity::default()
                }];
                node.offset_relative_expiry(&mut entities);
                node.update_entities(&entities);
            }
        }
    }
}

fn main() {
    if let Err(err) = execute() {
        if let Some(src) = err.source() {
            log::error!(target: "node", "Fatal: {err}: {src}");
        } else {
            log::error!(target: "node", "Fatal: {err}");
        }
        process::exit(1);
    }
}
