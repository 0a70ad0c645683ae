//! Subcommands of the `tusk` binary

use crate::state::AppState;
use anyhow::Context;
use clap::Subcommand;
use std::path::PathBuf;
use tokio::io::AsyncRead;
use tracing::info;
use tusk_core::{NewUpload, SessionStore, StagedUpload, Upload};
use tusk_crypto::ExpectedChecksum;
use tusk_tree::Tree;

/// Upload commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a space with an empty root directory
    InitSpace {
        /// Space id
        space: String,
        /// Owner reported in bytes-received events
        #[arg(long)]
        owner: String,
    },

    /// Start an upload and print its id
    Create {
        /// Space to upload into
        #[arg(long)]
        space: String,
        /// Parent directory id, defaults to the space root
        #[arg(long)]
        parent: Option<String>,
        /// File name within the parent
        #[arg(long)]
        name: String,
        /// Total size in bytes; omit to declare it later
        #[arg(long)]
        size: Option<u64>,
        /// Expected digest, e.g. "sha1 2aae6c35..."
        #[arg(long)]
        checksum: Option<String>,
        /// Acting user
        #[arg(long, default_value = "")]
        user: String,
        /// Metadata entries as key=value
        #[arg(long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,
    },

    /// Append a chunk from a file (or `-` for stdin)
    Write {
        /// Upload id
        id: String,
        /// Chunk source
        input: PathBuf,
        /// Expected current offset, defaults to the stored one
        #[arg(long)]
        offset: Option<u64>,
    },

    /// Declare the total size of a deferred-length upload
    DeclareLength {
        /// Upload id
        id: String,
        /// Total size in bytes
        length: u64,
    },

    /// Append the staged content of other uploads, in order
    Concat {
        /// Target upload id
        id: String,
        /// Partial upload ids
        #[arg(required = true)]
        parts: Vec<String>,
    },

    /// Verify and commit an upload
    Finish {
        /// Upload id
        id: String,
    },

    /// Store the blob of an upload awaiting asynchronous processing
    Finalize {
        /// Upload id
        id: String,
    },

    /// Abort an upload and remove everything it left behind
    Terminate {
        /// Upload id
        id: String,
    },

    /// Print upload progress
    Info {
        /// Upload id
        id: String,
    },

    /// Print the signed transfer URL of an upload
    Url {
        /// Upload id
        id: String,
    },

    /// Validate a transfer token and print its claims
    VerifyToken {
        /// Token
        token: String,
    },

    /// Print metadata of a node
    Stat {
        /// Space id
        space: String,
        /// Node id, defaults to the space root
        node: Option<String>,
    },

    /// Terminate expired uploads
    Sweep,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {:?}", s))
}

/// Run a command against the opened state
pub async fn run(state: &AppState, command: Command) -> anyhow::Result<()> {
    let engine = &state.engine;
    match command {
        Command::InitSpace { space, owner } => {
            let root = state.tree.create_space(&space, &owner);
            info!(space = %space, "space created");
            print_json(&state.tree.get_md(&root).await?)?;
        }

        Command::Create {
            space,
            parent,
            name,
            size,
            checksum,
            user,
            metadata,
        } => {
            let parent = parent.unwrap_or_else(|| space.clone());
            let mut request = NewUpload::new(space, parent, name).with_executant(user);
            if let Some(size) = size {
                request = request.with_size(size);
            }
            if let Some(checksum) = checksum {
                request = request.with_checksum(ExpectedChecksum::parse(&checksum)?);
            }
            for (key, value) in metadata {
                request = request.with_metadata(key, value);
            }
            let upload = engine.initiate(request).await?;
            println!("{}", upload.id());
        }

        Command::Write { id, input, offset } => {
            let mut upload = engine.load(&id).await?;
            let offset = offset.unwrap_or_else(|| upload.offset());
            let written = if input.as_os_str() == "-" {
                write_from(&mut upload, offset, &mut tokio::io::stdin()).await?
            } else {
                let mut file = tokio::fs::File::open(&input)
                    .await
                    .with_context(|| format!("failed to open {}", input.display()))?;
                write_from(&mut upload, offset, &mut file).await?
            };
            info!(upload_id = %id, written, offset = upload.offset(), "chunk accepted");
            finish_if_complete(&mut upload).await?;
            print_json(&upload.get_info())?;
        }

        Command::DeclareLength { id, length } => {
            let mut upload = engine.load(&id).await?;
            upload.declare_length(length).await?;
            finish_if_complete(&mut upload).await?;
            print_json(&upload.get_info())?;
        }

        Command::Concat { id, parts } => {
            let mut upload = engine.load(&id).await?;
            let mut loaded = Vec::with_capacity(parts.len());
            for part in &parts {
                loaded.push(engine.load(part).await?);
            }
            let refs: Vec<&dyn StagedUpload> =
                loaded.iter().map(|u| u as &dyn StagedUpload).collect();
            upload.concat_uploads(&refs).await?;
            engine.store().persist(upload.session()).await?;
            print_json(&upload.get_info())?;
        }

        Command::Finish { id } => {
            let mut upload = engine.load(&id).await?;
            upload.finish_upload().await?;
            println!("{}", upload.state());
        }

        Command::Finalize { id } => {
            engine.resume_pending(&id).await?;
            println!("done");
        }

        Command::Terminate { id } => {
            let mut upload = engine.load(&id).await?;
            upload.terminate().await;
            println!("terminated");
        }

        Command::Info { id } => {
            let upload = engine.load(&id).await?;
            print_json(&upload.session())?;
        }

        Command::Url { id } => {
            let upload = engine.load(&id).await?;
            println!("{}", upload.url()?);
        }

        Command::VerifyToken { token } => {
            print_json(&engine.issuer().validate(&token)?)?;
        }

        Command::Stat { space, node } => {
            let node_id = node.unwrap_or_else(|| space.clone());
            let node = tusk_tree::Lookup::read_node(&state.tree, &space, &node_id).await?;
            print_json(&state.tree.get_md(&node).await?)?;
        }

        Command::Sweep => {
            let swept = engine.sweep_expired(chrono::Utc::now()).await?;
            println!("{}", swept);
        }
    }

    state.flush().await
}

async fn write_from<R>(upload: &mut Upload, offset: u64, reader: &mut R) -> anyhow::Result<u64>
where
    R: AsyncRead + Unpin + Send,
{
    Ok(upload.write_chunk(offset, reader).await?)
}

/// Commit once every declared byte has arrived
async fn finish_if_complete(upload: &mut Upload) -> anyhow::Result<()> {
    if upload.session().is_complete() {
        upload.finish_upload().await?;
        info!(upload_id = %upload.id(), state = %upload.state(), "upload finished");
    }
    Ok(())
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
