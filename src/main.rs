//! Command-line driver: load the torrent, run the download and persist the
//! payload.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Result};
use clap::Parser;

use marmot::torrent::Torrent;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent client, written in Rust."
)]
struct Cli {
    /// Torrent file describing the download
    #[arg(value_name = "TORRENT")]
    torrent: PathBuf,

    /// Where to save the payload (defaults to the name in the torrent)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,
}

/// Turn the torrent's suggested name into a safe local filename.
///
/// Path separators are replaced so a hostile torrent cannot escape the
/// working directory, and an all-whitespace name falls back to a default.
fn safe_filename(name: &str) -> PathBuf {
    let cleaned: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();

    if cleaned.trim().is_empty() {
        PathBuf::from("download")
    } else {
        PathBuf::from(cleaned)
    }
}

/// Ask on stdin before clobbering an existing file.
fn confirm_overwrite(path: &Path) -> io::Result<bool> {
    println!("Output file {:?} already exists.", path);
    print!("Do you want to overwrite it? (y/N): ");
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;

    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn run(cli: Cli) -> Result<()> {
    let mut torrent = Torrent::new();
    torrent
        .open(cli.torrent.clone())
        .map_err(|error| anyhow!("could not load torrent {:?}: {}", cli.torrent, error))?;

    let output = cli
        .output
        .unwrap_or_else(|| safe_filename(torrent.name()));

    if output.exists() && !confirm_overwrite(&output)? {
        println!("Download cancelled.");
        return Ok(());
    }

    // Only touch the filesystem once the payload is complete and verified
    let data = torrent.download()?;
    fs::write(&output, &data)
        .map_err(|error| anyhow!("could not write payload to {:?}: {}", output, error))?;

    println!("Saved in {:?}.", output);

    Ok(())
}

fn main() -> ExitCode {
    pretty_env_logger::init_timed();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("Error: {}", error);
            ExitCode::FAILURE
        }
    }
}
