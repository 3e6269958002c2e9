use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;

use arcmount::formats::detect::ArchiveFormat;
use arcmount::fuse::{FuseOperations, MountedTree};
use arcmount::mountsource::factory::{assemble_tree, MountOptions};
use arcmount::overlay::WriteOverlay;

#[derive(Parser)]
#[command(
    name = "arcmount",
    version = "1.0.0",
    about = "Mount archives (TAR, ZIP, SquashFS, SQLAR, compressed streams) as a \
             random-access read-only filesystem, with an optional copy-on-write overlay.",
    long_about = None,
)]
struct Cli {
    /// Archive or folder paths to mount, optionally followed by the mount
    /// point (default: first archive's name without its extension)
    #[arg(required = true, num_args = 1..)]
    paths: Vec<PathBuf>,

    // ── Index ────────────────────────────────────────────────────────────────
    /// Index file to use (may be a .gz/.xz/.zst compressed index)
    #[arg(long, value_name = "PATH")]
    index_file: Option<PathBuf>,
    /// Folders to search for and store index files, in order
    #[arg(long, value_name = "DIR", num_args = 1..)]
    index_folders: Vec<PathBuf>,
    /// Discard any existing index and rebuild it
    #[arg(long)]
    recreate_index: bool,
    /// Also compare the archive modification time when validating an index
    #[arg(long)]
    verify_mtime: bool,

    // ── Recursion ────────────────────────────────────────────────────────────
    /// Mount archives inside archives (same as --recursion-depth with no bound)
    #[arg(short, long)]
    recursive: bool,
    /// Maximum number of archive boundaries to recurse through
    #[arg(long, value_name = "N")]
    recursion_depth: Option<u32>,
    /// Mount nested archives on first access instead of at startup
    #[arg(short, long)]
    lazy: bool,
    /// Strip .tar (and friends) from recursive mount points
    #[arg(long)]
    strip_recursive_tar_extension: bool,
    /// Rewrite recursive mount points: a regex pattern and its replacement
    #[arg(long, value_names = ["REGEX", "REPLACEMENT"], num_args = 2)]
    transform_recursive_mount_point: Option<Vec<String>>,

    // ── Archive quirks ───────────────────────────────────────────────────────
    /// Entry-name encoding recorded in the index
    #[arg(long, default_value = "utf-8")]
    encoding: String,
    /// Keep scanning past zero blocks (concatenated TAR archives)
    #[arg(long)]
    ignore_zeros: bool,
    /// Force GNU-incremental prefix stripping on
    #[arg(long, conflicts_with = "no_gnu_incremental")]
    gnu_incremental: bool,
    /// Force GNU-incremental prefix stripping off
    #[arg(long)]
    no_gnu_incremental: bool,
    /// Auto-detect GNU-incremental archives (the default)
    #[arg(long, conflicts_with_all = ["gnu_incremental", "no_gnu_incremental"])]
    detect_gnu_incremental: bool,

    // ── Write mode ───────────────────────────────────────────────────────────
    /// Folder receiving all modifications (copy-on-write overlay)
    #[arg(long, value_name = "DIR")]
    write_overlay: Option<PathBuf>,
    /// Apply the overlay's deletions and additions back to the archive
    /// (interactive; invokes GNU tar)
    #[arg(long, requires = "write_overlay")]
    commit_overlay: bool,

    // ── FUSE ─────────────────────────────────────────────────────────────────
    /// FUSE mount options, comma separated
    #[arg(short = 'o', value_name = "K=V,...")]
    fuse_options: Option<String>,
    /// Stay in the foreground (also enables log output to stderr)
    #[arg(short = 'f', long)]
    foreground: bool,
    /// Accepted for compatibility; the FUSE session is always
    /// single-threaded here
    #[arg(long)]
    nothreads: bool,
    /// Unmount the given mount point and exit
    #[arg(short = 'u', long)]
    unmount: bool,

    // ── Performance ──────────────────────────────────────────────────────────
    /// Distance between gzip seek points in MiB
    #[arg(long, value_name = "MIB", default_value = "16")]
    gzip_seek_point_spacing: u64,
    /// Worker threads for parallel xz/zstd block decoding
    #[arg(short = 'P', long, value_name = "N", default_value = "1")]
    parallelization: usize,

    // ── Passwords ────────────────────────────────────────────────────────────
    /// Password for encrypted archive entries (repeatable)
    #[arg(long)]
    password: Vec<String>,
    /// File with one password per line, tried in order
    #[arg(long, value_name = "FILE")]
    password_file: Option<PathBuf>,

    /// Backend priority, highest first (tar, zip, sqlar, squashfs)
    #[arg(long, value_name = "NAME", num_args = 1..)]
    prioritized_backends: Vec<String>,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(if cli.debug { "debug" } else { "warn" }),
    )
    .init();

    match run(cli) {
        Ok(()) => {}
        Err(error) => {
            // User/configuration errors exit 1; anything deeper exits 2.
            let code = if error.downcast_ref::<arcmount::ArcError>()
                .map(|e| matches!(e, arcmount::ArcError::Usage(_)))
                .unwrap_or(true)
            {
                1
            } else {
                2
            };
            eprintln!("error: {error:#}");
            std::process::exit(code);
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if cli.unmount {
        let mount_point = cli.paths.first().context("missing mount point to unmount")?;
        return unmount(mount_point);
    }

    let (archives, mount_point) = split_positionals(&cli.paths)?;
    let options = build_options(&cli)?;

    if cli.commit_overlay {
        return commit_overlay(
            &archives,
            cli.write_overlay.as_deref().expect("clap enforces --write-overlay"),
            &options,
        );
    }

    let tree = assemble_tree(&archives, &options)
        .with_context(|| format!("cannot open {}", archives[0].display()))?;

    let tree = match &cli.write_overlay {
        Some(folder) => MountedTree::Writable(WriteOverlay::new(folder, tree)?),
        None => MountedTree::ReadOnly(tree),
    };

    if !mount_point.exists() {
        std::fs::create_dir_all(&mount_point)
            .with_context(|| format!("cannot create mount point {}", mount_point.display()))?;
    }
    if !mount_point.is_dir() {
        bail!("mount point {} is not a directory", mount_point.display());
    }

    let mut fuse_options = vec![
        fuser::MountOption::FSName("arcmount".into()),
        fuser::MountOption::DefaultPermissions,
    ];
    if cli.write_overlay.is_none() {
        fuse_options.push(fuser::MountOption::RO);
    }
    if let Some(extra) = &cli.fuse_options {
        for option in extra.split(',').filter(|o| !o.is_empty()) {
            fuse_options.push(match option {
                "allow_other" => fuser::MountOption::AllowOther,
                "allow_root"  => fuser::MountOption::AllowRoot,
                "auto_unmount" => fuser::MountOption::AutoUnmount,
                "nodev"       => fuser::MountOption::NoDev,
                "nosuid"      => fuser::MountOption::NoSuid,
                "noexec"      => fuser::MountOption::NoExec,
                "noatime"     => fuser::MountOption::NoAtime,
                other         => fuser::MountOption::CUSTOM(other.to_string()),
            });
        }
    }

    // One SQLite connection and per-handle decoder state mandate a
    // single-threaded session; fuser's blocking loop runs all callbacks
    // on this thread, so --nothreads always holds.
    if cli.nothreads {
        log::debug!("single-threaded session (always on)");
    }
    if !cli.foreground {
        log::info!("staying in the foreground; use a service manager to background arcmount");
    }
    let operations = FuseOperations::new(tree);
    log::info!("mounting on {}", mount_point.display());
    fuser::mount2(operations, &mount_point, &fuse_options)
        .with_context(|| format!("FUSE mount on {} failed", mount_point.display()))?;
    Ok(())
}

/// The last positional is the mount point when it is not itself a
/// mountable input (or does not exist yet).
fn split_positionals(paths: &[PathBuf]) -> Result<(Vec<PathBuf>, PathBuf)> {
    if paths.len() >= 2 {
        let last = &paths[paths.len() - 1];
        let is_input = last.is_file()
            || (last.is_dir() && std::fs::read_dir(last).map(|mut d| d.next().is_some()).unwrap_or(false));
        if !is_input {
            return Ok((paths[..paths.len() - 1].to_vec(), last.clone()));
        }
    }
    let archives = paths.to_vec();
    let first = &archives[0];
    let default_name = first
        .file_stem()
        .map(|stem| PathBuf::from(stem))
        .unwrap_or_else(|| PathBuf::from("mounted"));
    Ok((archives, default_name))
}

fn build_options(cli: &Cli) -> Result<MountOptions> {
    let mut passwords = cli.password.clone();
    if let Some(file) = &cli.password_file {
        let reader = std::io::BufReader::new(
            std::fs::File::open(file)
                .with_context(|| format!("cannot read password file {}", file.display()))?,
        );
        for line in reader.lines() {
            let line = line?;
            if !line.is_empty() {
                passwords.push(line);
            }
        }
    }

    let mut prioritized = Vec::new();
    for name in &cli.prioritized_backends {
        prioritized.push(
            ArchiveFormat::from_name(name)
                .with_context(|| format!("unknown backend {name}"))?,
        );
    }

    let recursion_depth = match (cli.recursive, cli.recursion_depth) {
        (_, Some(depth)) => depth,
        (true, None) => u32::MAX,
        (false, None) => 0,
    };

    let transform = cli.transform_recursive_mount_point.as_ref().map(|pair| {
        (pair[0].clone(), pair[1].clone())
    });

    Ok(MountOptions {
        index_file: cli.index_file.clone(),
        index_folders: cli.index_folders.clone(),
        recreate_index: cli.recreate_index,
        verify_mtime: cli.verify_mtime,
        recursion_depth,
        lazy: cli.lazy,
        strip_recursive_tar_extension: cli.strip_recursive_tar_extension,
        transform_recursive_mount_point: transform,
        ignore_zeros: cli.ignore_zeros,
        gnu_incremental: if cli.gnu_incremental {
            Some(true)
        } else if cli.no_gnu_incremental {
            Some(false)
        } else {
            // Auto-detection; --detect-gnu-incremental spells it out.
            let _ = cli.detect_gnu_incremental;
            None
        },
        encoding: cli.encoding.clone(),
        gzip_seek_point_spacing: cli.gzip_seek_point_spacing.max(1) * 1024 * 1024,
        parallelization: cli.parallelization.max(1),
        passwords,
        prioritized_backends: prioritized,
    })
}

fn unmount(mount_point: &Path) -> Result<()> {
    let status = std::process::Command::new("fusermount")
        .arg("-u")
        .arg(mount_point)
        .status()
        .context("cannot run fusermount")?;
    if !status.success() {
        bail!("fusermount -u {} failed", mount_point.display());
    }
    Ok(())
}

/// Offline overlay commit: emit null-separated deletion and append lists,
/// confirm, then drive GNU tar.
fn commit_overlay(archives: &[PathBuf], overlay_folder: &Path, options: &MountOptions) -> Result<()> {
    if archives.len() != 1 {
        bail!("--commit-overlay needs exactly one archive");
    }
    let archive = &archives[0];
    if !archive.is_file() {
        bail!("--commit-overlay only works on plain TAR archives");
    }

    let tree = assemble_tree(archives, options)?;
    let mut overlay = WriteOverlay::new(overlay_folder, tree)?;
    let (deletions, appends) = overlay.commit_lists()?;

    if deletions.is_empty() && appends.is_empty() {
        println!("overlay is empty; nothing to commit");
        return Ok(());
    }

    println!("changes to apply to {}:", archive.display());
    for path in &deletions {
        println!("  delete {path}");
    }
    for path in &appends {
        println!("  append {path}");
    }
    print!("proceed? [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    if !matches!(answer.trim(), "y" | "Y" | "yes") {
        println!("aborted");
        return Ok(());
    }

    // Null-separated member lists keep names with spaces and newlines
    // intact across the tar invocations.
    let staging = tempfile::tempdir()?;
    let deletion_list = staging.path().join("deletions");
    let append_list = staging.path().join("appends");
    write_null_separated(&deletion_list, &deletions)?;
    write_null_separated(&append_list, &appends)?;

    if !deletions.is_empty() {
        let status = std::process::Command::new("tar")
            .arg("--delete")
            .arg("--null")
            .arg("--files-from").arg(&deletion_list)
            .arg("--file").arg(archive)
            .status()
            .context("cannot run tar --delete")?;
        if !status.success() {
            bail!("tar --delete failed");
        }
    }
    if !appends.is_empty() {
        let status = std::process::Command::new("tar")
            .arg("--append")
            .arg("--null")
            .arg("--files-from").arg(&append_list)
            .arg("-C").arg(overlay_folder)
            .arg("--file").arg(archive)
            .status()
            .context("cannot run tar --append")?;
        if !status.success() {
            bail!("tar --append failed");
        }
    }

    println!("committed {} deletion(s) and {} append(s)", deletions.len(), appends.len());
    Ok(())
}

fn write_null_separated(path: &Path, entries: &[String]) -> Result<()> {
    let mut out = std::fs::File::create(path)?;
    for entry in entries {
        // tar member names are archive-relative, without the leading '/'.
        out.write_all(entry.trim_start_matches('/').as_bytes())?;
        out.write_all(&[0])?;
    }
    Ok(())
}
