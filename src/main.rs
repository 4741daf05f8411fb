mod cli;

use streamrelay::{config, server};
use streamrelay_av::{check_tools, resolve_tool_path, ProfileRegistry, StreamProber};

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};

async fn start_server(
    host: Option<String>,
    port: Option<u16>,
    config_path: Option<&std::path::Path>,
) -> Result<()> {
    let mut config = config::load_config_or_default(config_path)?;

    // CLI flags win over the config file
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    config::validate_config(&config)?;

    tracing::info!("Starting Streamrelay server");
    tracing::info!(
        "Publishing HLS from {:?} under {}",
        config.hls.root,
        config.hls.mount_path
    );

    server::start_server(config).await
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // Respect RUST_LOG env var if set, otherwise use defaults based on verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "streamrelay=trace,streamrelay_av=trace,tower_http=debug".to_string()
        } else {
            "streamrelay=debug,streamrelay_av=debug,tower_http=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .init();

    match cli.command {
        Commands::Start { host, port } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(start_server(host, port, cli.config.as_deref()))
        }
        Commands::Probe { url, json } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(probe_stream(&url, json, cli.config.as_deref()))
        }
        Commands::Profiles => list_profiles(),
        Commands::CheckTools => run_check_tools(cli.config.as_deref()),
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("streamrelay {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn probe_stream(url: &str, json: bool, config_path: Option<&std::path::Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;
    let prober = StreamProber::new(resolve_tool_path(&config.tools.ffprobe))
        .with_timeout(config.relay.probe_timeout());

    let info = prober.probe(url).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("Source: {}", info.source);
    println!("Format: {}", info.format_name);
    match info.duration_secs {
        Some(secs) if !info.is_live() => {
            let secs = secs as u64;
            println!("Duration: {:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60);
        }
        _ => println!("Duration: live"),
    }
    if let Some(bit_rate) = info.bit_rate {
        println!("Bit rate: {} kb/s", bit_rate / 1000);
    }

    println!("\nVideo Streams: {}", info.video_streams.len());
    for (i, stream) in info.video_streams.iter().enumerate() {
        print!("  [{}] {} {}x{}", i, stream.codec, stream.width, stream.height);
        if let Some(fps) = stream.frame_rate {
            print!(" {:.3} fps", fps);
        }
        println!();
    }

    println!("\nAudio Streams: {}", info.audio_streams.len());
    for (i, stream) in info.audio_streams.iter().enumerate() {
        print!("  [{}] {} {}ch", i, stream.codec, stream.channels);
        if let Some(rate) = stream.sample_rate {
            print!(" {} Hz", rate);
        }
        println!();
    }

    Ok(())
}

fn list_profiles() -> Result<()> {
    let registry = ProfileRegistry::standard();

    for profile in registry.iter() {
        println!(
            "{:<20} {:<12} {}",
            profile.name,
            format!("{:?}", profile.delivery).to_lowercase(),
            profile.content_type.as_deref().unwrap_or("-")
        );
    }

    Ok(())
}

fn run_check_tools(config_path: Option<&std::path::Path>) -> Result<()> {
    let config = config::load_config_or_default(config_path)?;

    println!("Checking external tools...\n");

    let tools = check_tools(
        &config.tools.ffmpeg.to_string_lossy(),
        &config.tools.ffprobe.to_string_lossy(),
    );
    let mut all_ok = true;

    for tool in &tools {
        let status = if tool.available {
            "✓"
        } else {
            all_ok = false;
            "✗"
        };

        print!("{} {}", status, tool.name);

        if let Some(ref version) = tool.version {
            print!(" ({})", version);
        }

        if let Some(ref path) = tool.path {
            print!(" - {}", path.display());
        }

        println!();
    }

    println!();
    if all_ok {
        println!("All required tools are available!");
    } else {
        anyhow::bail!("Some tools are missing. Install ffmpeg to relay streams.");
    }

    Ok(())
}

fn validate_config(path: Option<&std::path::Path>) -> Result<()> {
    match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            println!("  Server: {}:{}", config.server.host, config.server.port);
            println!("  ffmpeg: {}", config.tools.ffmpeg.display());
            println!("  ffprobe: {}", config.tools.ffprobe.display());
            println!(
                "  HLS: {} -> {:?} ({} x {}s segments)",
                config.hls.mount_path,
                config.hls.root,
                config.hls.max_segments,
                config.hls.segment_duration_secs
            );
            match config.settings.path {
                Some(ref path) => println!("  Settings: {}", path.display()),
                None => println!("  Settings: built-in defaults"),
            }
        }
        None => {
            println!("No config file specified, using defaults");
            let config = config::Config::default();
            println!("Default config:");
            println!("  Server: {}:{}", config.server.host, config.server.port);
        }
    }

    Ok(())
}
