use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "amityvox", about = "AmityVox federated chat instance", version)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "./config.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the instance.
    Serve,
    /// Write a default config.toml.
    InitConfig,
    /// Generate the instance Ed25519 keypair and print the public key.
    GenerateKeys,
    /// Inspect and manage federation peers.
    Peer {
        #[command(subcommand)]
        command: PeerCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum PeerCommand {
    /// Handshake with a remote instance by domain.
    Add { domain: String },
    /// List known peers and their health.
    List,
    /// Remove a peer relationship.
    Remove { peer_id: String },
    /// Always deny a peer, regardless of federation mode.
    Block { peer_id: String },
    /// Always admit a peer, regardless of federation mode.
    Allow { peer_id: String },
    /// Admit a peer only through the instance-wide mode.
    Mute { peer_id: String },
    /// Drop any per-peer override.
    Clear { peer_id: String },
    /// Show dead letters awaiting operator attention.
    DeadLetters,
}
