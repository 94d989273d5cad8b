use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use relcut_service::utils::resolve_working_dir;
use relcut_service::version::{restore, DEFAULT_STAGING};

/// Copy staged backups back onto the tree
#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Tree root (default: repository root of the current directory)
    #[arg(long, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Staging directory holding the backups (default: <root>/.relcut-staging)
    #[arg(long, value_name = "DIR")]
    pub staging_dir: Option<PathBuf>,
}

pub fn execute(args: RestoreArgs) -> Result<()> {
    let root = args.root.unwrap_or_else(resolve_working_dir);
    let staging_dir = args
        .staging_dir
        .unwrap_or_else(|| root.join(DEFAULT_STAGING));

    output::status("Restoring", &format!("{}", staging_dir.display()));
    let report = restore(&root, &staging_dir)?;

    if report.restored.is_empty() && report.failed.is_empty() {
        output::dim("  No backups to restore");
        return Ok(());
    }

    for path in &report.restored {
        output::check(&format!("{}", path.display()));
    }
    for (path, error) in &report.failed {
        output::failure(&format!("{}: {}", path.display(), error));
    }

    if !report.success() {
        output::error(&format!(
            "{} file(s) could not be restored; backups kept",
            report.failed.len()
        ));
        std::process::exit(1);
    }

    output::success(&format!("{} file(s) restored", report.restored.len()));
    Ok(())
}
