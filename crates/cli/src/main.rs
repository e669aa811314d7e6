//! Charly CLI
//!
//! `charly [filename] [--flag ...] [-- user args...]`
//!
//! Boots the runtime and executes a program. The source-to-bytecode
//! pipeline is an external producer: embedders register assembled module
//! bundles through the runtime API. Without a producer linked in, the CLI
//! can bring the runtime up (`--skipexec`), print metadata, and report a
//! clear error for source files it cannot compile.
//!
//! Exit codes: 0 on success, 1 on an unhandled exception in the main
//! fiber, arbitrary codes from `exit(n)`.

use std::path::{Path, PathBuf};
use std::process;

use charly_runtime::{Runtime, RuntimeOptions};
use clap::Parser as ClapParser;

const LICENSE: &str = "\
The Charly Virtual Machine is published under the MIT license.
See https://github.com/KCreate/charly-vm for the full license text.";

#[derive(ClapParser)]
#[command(name = "charly")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Charly virtual machine", long_about = None)]
struct Cli {
    /// Program to execute; defaults to the stdlib REPL module
    filename: Option<PathBuf>,

    /// Amount of virtual processors (defaults to hardware concurrency)
    #[arg(long, value_name = "N")]
    maxprocs: Option<usize>,

    /// Initially mapped heap regions
    #[arg(long = "initial_heap_regions", value_name = "N")]
    initial_heap_regions: Option<usize>,

    /// Register modules without executing them
    #[arg(long)]
    skipexec: bool,

    /// Validate the heap and all roots around every GC cycle
    #[arg(long = "validate_heap")]
    validate_heap: bool,

    /// Disable AST optimisation passes in the compiler frontend
    #[arg(long = "no_ast_opt")]
    no_ast_opt: bool,

    /// Dump the IR of compiled modules
    #[arg(long)]
    ir: bool,

    /// Dump the disassembly of compiled modules
    #[arg(long)]
    asm: bool,

    /// Dump the AST of compiled modules
    #[arg(long)]
    ast: bool,

    /// Print the license and exit
    #[arg(long)]
    license: bool,

    /// Arguments passed to the program via the ARGV global
    #[arg(last = true)]
    user_args: Vec<String>,
}

/// Installation root, taken from the CHARLYVMDIR environment variable.
fn installation_root() -> Option<PathBuf> {
    std::env::var_os("CHARLYVMDIR").map(PathBuf::from)
}

/// Path of the first user-visible stdlib module.
fn boot_module_path(root: &Path) -> PathBuf {
    root.join("src").join("charly").join("stdlib").join("boot.ch")
}

/// Path of the module loaded when no filename is given.
fn repl_module_path(root: &Path) -> PathBuf {
    root.join("src").join("charly").join("stdlib").join("repl.ch")
}

fn main() {
    let cli = Cli::parse();

    if cli.license {
        println!("{LICENSE}");
        return;
    }

    if cli.ir || cli.asm || cli.ast || cli.no_ast_opt {
        eprintln!("charly: compiler frontend flags have no effect without a bytecode producer");
    }

    let options = RuntimeOptions {
        maxprocs: cli.maxprocs,
        initial_heap_regions: cli
            .initial_heap_regions
            .unwrap_or(charly_runtime::heap::INITIAL_MAPPED_REGION_COUNT),
        skipexec: cli.skipexec,
        validate_heap: cli.validate_heap,
        argv: cli.user_args.clone(),
    };

    // resolve the module to execute: an explicit filename, or the stdlib
    // REPL module below CHARLYVMDIR
    let filename = match cli.filename {
        Some(filename) => filename,
        None => {
            let Some(root) = installation_root() else {
                eprintln!("charly: CHARLYVMDIR environment variable is not set");
                process::exit(1);
            };
            let boot = boot_module_path(&root);
            if !boot.is_file() {
                eprintln!("charly: missing stdlib module at '{}'", boot.display());
                process::exit(1);
            }
            repl_module_path(&root)
        }
    };

    if cli.skipexec {
        // bring the runtime up and shut it down without executing anything
        let exit_code = Runtime::run(options, None);
        process::exit(exit_code);
    }

    if !filename.is_file() {
        eprintln!("charly: could not open the file at '{}'", filename.display());
        process::exit(1);
    }

    // the source pipeline lives in an external producer; this binary only
    // ships the runtime core
    eprintln!(
        "charly: no bytecode producer is linked into this build, cannot execute '{}'",
        filename.display()
    );
    eprintln!("charly: embedders hand assembled module bundles to the runtime directly");
    process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_module_path_layout() {
        let root = Path::new("/opt/charly");
        assert_eq!(
            boot_module_path(root),
            PathBuf::from("/opt/charly/src/charly/stdlib/boot.ch")
        );
        assert_eq!(
            repl_module_path(root),
            PathBuf::from("/opt/charly/src/charly/stdlib/repl.ch")
        );
    }

    #[test]
    #[serial_test::serial]
    fn test_installation_root_reads_environment() {
        let original = std::env::var_os("CHARLYVMDIR");

        // SAFETY: serialised by the serial attribute
        unsafe { std::env::set_var("CHARLYVMDIR", "/tmp/charly-test") };
        assert_eq!(installation_root(), Some(PathBuf::from("/tmp/charly-test")));

        unsafe {
            match original {
                Some(value) => std::env::set_var("CHARLYVMDIR", value),
                None => std::env::remove_var("CHARLYVMDIR"),
            }
        }
    }

    #[test]
    fn test_cli_flag_parsing() {
        let cli = Cli::parse_from([
            "charly",
            "program.ch",
            "--maxprocs",
            "4",
            "--initial_heap_regions",
            "16",
            "--validate_heap",
            "--",
            "one",
            "two",
        ]);
        assert_eq!(cli.filename, Some(PathBuf::from("program.ch")));
        assert_eq!(cli.maxprocs, Some(4));
        assert_eq!(cli.initial_heap_regions, Some(16));
        assert!(cli.validate_heap);
        assert!(!cli.skipexec);
        assert_eq!(cli.user_args, vec!["one".to_string(), "two".to_string()]);
    }
}
