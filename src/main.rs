use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use pilot::config::Config;
use pilot::logging;
use pilot::session::ProfileUpdate;
use pilot::ui::Transport;
use pilot::ui::repl;

#[derive(Parser)]
#[command(name = "pilot")]
#[command(version)]
#[command(about = "Chat with a streaming assistant from the terminal", long_about = None)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an interactive chat (default)
    Chat(ChatArgs),
    /// Show or update your profile
    Profile(ProfileArgs),
    /// Print the effective configuration
    Config,
}

#[derive(Args, Default)]
struct ChatArgs {
    /// Socket base URL, e.g. ws://localhost:8000
    #[arg(long)]
    url: Option<String>,

    /// HTTP base URL for the event-stream transport
    #[arg(long)]
    http_url: Option<String>,

    #[arg(long, value_enum, default_value_t = Transport::Ws)]
    transport: Transport,
}

#[derive(Args)]
struct ProfileArgs {
    #[arg(long)]
    first_name: Option<String>,
    #[arg(long)]
    last_name: Option<String>,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    preferences: Option<String>,

    /// Restore the empty profile
    #[arg(long, conflicts_with_all = ["first_name", "last_name", "email", "preferences"])]
    reset: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    match cli.command.unwrap_or(Commands::Chat(ChatArgs::default())) {
        Commands::Chat(args) => {
            let mut config = Config::load()?;
            if let Some(url) = args.url {
                config.ws_base_url = url;
            }
            if let Some(url) = args.http_url {
                config.http_base_url = url;
            }
            repl::run(config, args.transport).await
        }
        Commands::Profile(args) => update_profile(args),
        Commands::Config => {
            print!("{}", Config::load()?.to_toml()?);
            Ok(())
        }
    }
}

fn update_profile(args: ProfileArgs) -> Result<()> {
    // Read the file as-is so environment overrides are not written back.
    let mut config = Config::load_from(&Config::default_path()?)?;
    let update = ProfileUpdate {
        first_name: args.first_name,
        last_name: args.last_name,
        email: args.email,
        preferences: args.preferences,
    };

    if args.reset {
        config.profile = Default::default();
        config.save()?;
        println!("✅ Profile reset");
    } else if !update.is_empty() {
        update.apply(&mut config.profile);
        config.save()?;
        println!("✅ Profile saved");
    }

    let profile = &config.profile;
    println!("👤 Name:        {}", profile.display_name().unwrap_or_else(|| "(not set)".to_string()));
    println!("📧 Email:       {}", profile.email);
    println!("💡 Preferences: {}", profile.preferences);
    Ok(())
}
