#![forbid(unsafe_code)]

//! Offline inspection and maintenance for a decomposed storage tree.

use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;

use decomposedfs::blobstore::FsBlobstore;
use decomposedfs::context::OperationContext;
use decomposedfs::layout::SpaceType;
use decomposedfs::node::Node;
use decomposedfs::output::{self, OutputArgs};
use decomposedfs::recycle;
use decomposedfs::tree::{FsOptions, Tree};
use decomposedfs::vocab::{NodeId, Reference, User, UserId};

#[derive(Parser)]
#[command(name = "decomposedfs", about = "Inspect and maintain a decomposed storage tree")]
struct Cli {
    /// Storage root directory.
    #[arg(long, default_value = ".")]
    root: PathBuf,
    #[command(flatten)]
    output: OutputArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List all spaces.
    Spaces,
    /// List the children of a folder, addressed by reference
    /// (`storage$space!node/path`).
    Ls { reference: String },
    /// List the recycle bin of a space.
    Trash { space_id: String },
    /// Scan for orphaned nodes, dangling links and stale trash origins.
    Fsck {
        /// Repair findings instead of only reporting them.
        #[arg(long)]
        apply: bool,
    },
}

/// Act as the owner of the space so the permission evaluator lets the
/// inspection through. Ownerless (project) spaces fall back to an anonymous
/// identity and surface whatever the grants allow.
fn owner_ctx(root: &Node) -> eyre::Result<OperationContext> {
    let owner = root.owner()?.unwrap_or_else(UserId::nobody);
    Ok(OperationContext::new(User::new(owner, "inspector")))
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    output::init(&cli.output);

    let blobs = Arc::new(FsBlobstore::new(&cli.root.join("blobs"))?);
    let tree = Tree::new(FsOptions::new(&cli.root), blobs)?;

    match cli.command {
        Command::Spaces => {
            for space_type in SpaceType::all() {
                for root in tree.list_spaces(space_type)? {
                    let size = root.tree_size()?.unwrap_or(0);
                    println!(
                        "{} {} {} ({} bytes)",
                        style(space_type).dim(),
                        root.id,
                        style(&root.name).bold(),
                        size,
                    );
                }
            }
        }
        Command::Ls { reference } => {
            let reference: Reference = reference.as_str().try_into()?;
            let root = tree.node_by_id(&reference.space_root()?, &reference.space_root()?)?;
            let ctx = owner_ctx(&root)?;
            let dir = tree.lookup_ref(&ctx, &reference)?;
            for child in tree.list_folder(&ctx, &dir)? {
                println!(
                    "{} {:>12} {}",
                    style(child.kind()).dim(),
                    child.size()?,
                    child.name,
                );
            }
        }
        Command::Trash { space_id } => {
            let space: NodeId = space_id.as_str().try_into()?;
            for entry in recycle::list(tree.lookup(), &space)? {
                println!(
                    "{} {:>12} {} {}",
                    entry.deleted_at.to_rfc3339(),
                    entry.size,
                    entry.key,
                    style(&entry.restore_path).bold(),
                );
            }
        }
        Command::Fsck { apply } => {
            let report = tree.fsck(apply)?;
            if report.is_clean() {
                println!("{}", style("tree is consistent").green());
            } else {
                for id in &report.orphaned_nodes {
                    println!("{} {id}", style("orphaned node").red());
                }
                for link in &report.dangling_links {
                    println!("{} {}", style("dangling link").red(), link.display());
                }
                for id in &report.stale_trash_origins {
                    println!("{} {id}", style("stale trash origin").yellow());
                }
                if apply {
                    println!("{}", style("repaired").green());
                }
            }
        }
    }
    Ok(())
}
