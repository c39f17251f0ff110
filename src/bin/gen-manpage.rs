//! Man page generator for flashy
//!
//! Writes `flashy.1` plus one `flashy-<subcommand>.1` page per subcommand.
//!
//! Usage: cargo run --bin gen-manpage -- [output-dir]

use clap::{Command, CommandFactory};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[path = "../cli.rs"]
mod cli;

fn render(cmd: Command, title: &str, output_dir: &Path) -> io::Result<PathBuf> {
    let mut buffer = Vec::new();
    clap_mangen::Man::new(cmd).title(title).render(&mut buffer)?;
    let path = output_dir.join(format!("{}.1", title));
    fs::write(&path, buffer)?;
    Ok(path)
}

/// Render every page into `output_dir`
fn generate(output_dir: &Path) -> io::Result<Vec<PathBuf>> {
    fs::create_dir_all(output_dir)?;
    let cmd = cli::Cli::command();
    let mut pages = vec![render(cmd.clone(), "flashy", output_dir)?];
    for sub in cmd.get_subcommands().filter(|s| s.get_name() != "help") {
        // Subcommand pages are titled like git's: flashy-run(1)
        let title = format!("flashy-{}", sub.get_name());
        pages.push(render(sub.clone(), &title, output_dir)?);
    }
    Ok(pages)
}

fn main() -> io::Result<()> {
    let output_dir = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("man"));

    let pages = generate(&output_dir)?;
    for page in &pages {
        println!("Generated {}", page.display());
    }
    println!("\nView with: man -l {}", output_dir.join("flashy.1").display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_per_subcommand() {
        let dir = tempfile::tempdir().unwrap();
        let pages = generate(dir.path()).unwrap();
        let names: Vec<_> = pages
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            names,
            ["flashy.1", "flashy-run.1", "flashy-list.1", "flashy-status.1"]
        );

        let run = fs::read_to_string(dir.path().join("flashy-run.1")).unwrap();
        assert!(run.contains(".TH"));
        assert!(run.contains("progress"));
        assert!(!run.contains("Show vboot enforcement"));
    }
}
