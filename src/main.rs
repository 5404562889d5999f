// Copyright 2026 Alexander Orlov <alexander.orlov@loxal.net>

mod crypto;
mod fs;
mod subprocess;

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

use clap::Parser;

use crate::crypto::GpgTool;
use crate::fs::AsymFs;

#[derive(Parser)]
#[command(name = "asymfs", about = "FUSE overlay filesystem encrypting every file to a set of gpg recipients")]
struct Cli {
    /// Directory holding the ciphertext (storage backend)
    #[arg(long)]
    backing: PathBuf,

    /// FUSE mount point presenting the plaintext view
    #[arg(long)]
    mountpoint: PathBuf,

    /// Key identifier to encrypt to (repeat for multiple recipients)
    #[arg(short = 'r', long = "recipient", required = true)]
    recipients: Vec<String>,

    /// Permit decrypting reads; without it the mount is write-only and
    /// pre-existing files cannot be read back
    #[arg(long)]
    read: bool,

    /// Encryption tool binary
    #[arg(long, default_value = "gpg")]
    gpg: String,

    /// Extra mount option passed to the FUSE layer (repeatable)
    #[arg(short = 'o', long = "option")]
    options: Vec<String>,

    /// FUSE dispatch threads
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut afs = match AsymFs::new(&cli.backing, cli.read, GpgTool::new(cli.gpg)) {
        Ok(afs) => afs,
        Err(e) => {
            eprintln!(
                "asymfs: error: cannot open backing directory {}: {e}",
                cli.backing.display()
            );
            std::process::exit(1);
        }
    };
    afs.set_recipients(cli.recipients);
    if !afs.ready() {
        eprintln!("asymfs: error: a backing directory and at least one recipient are required");
        std::process::exit(1);
    }

    eprintln!("asymfs: mounting at {}", cli.mountpoint.display());
    eprintln!("asymfs: ciphertext stored in {}", cli.backing.display());
    if !cli.read {
        eprintln!("asymfs: write-only mode — existing files cannot be read back through the mount");
    }
    eprintln!("asymfs: NOTE: open files are buffered in RAM until their last handle closes");
    eprintln!("asymfs: press Ctrl+C to unmount");

    let mut fuse_args: Vec<OsString> =
        vec![OsString::from("-o"), OsString::from("fsname=asymfs")];
    for option in &cli.options {
        fuse_args.push(OsString::from("-o"));
        fuse_args.push(OsString::from(option));
    }
    let fuse_args: Vec<&OsStr> = fuse_args.iter().map(OsString::as_os_str).collect();

    if let Err(e) = fuse_mt::mount(
        fuse_mt::FuseMT::new(afs, cli.threads),
        &cli.mountpoint,
        &fuse_args,
    ) {
        eprintln!("asymfs: mount failed: {e}");
        std::process::exit(1);
    }
}
