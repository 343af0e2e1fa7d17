//! protodist command-line entry point.
//!
//! A thin shell over the library crates: every subcommand parses its
//! arguments, calls one library operation, and prints the result. Exit
//! codes: 0 success, 1 unrecoverable error, 2 argument error, 124 timeout.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use protodist_bsr::{BsrResolver, ModuleRef};
use protodist_cas::{DigestCache, MetadataStore};
use protodist_core::{ArtifactRef, CacheLayout, Error, Platform, Result};
use protodist_credentials::CredentialStore;
use protodist_notify::{ChangeNotification, Dispatcher, Priority, WebhookChannel};
use protodist_publisher::{collect_dir, PublishOptions, Publisher};
use protodist_registry::RegistryClient;
use protodist_resolver::{ResolveRequest, Resolver, Tool};
use protodist_version::{latest_in_tags, Version, VersionAnalyzer};

#[derive(Parser)]
#[command(name = "protodist", version, about = "Content-addressable artifact distributor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve a tool to a ready-to-execute cached path.
    Resolve {
        /// Tool name (protoc, buf, or a plugin catalogue name).
        tool: String,
        /// Tool version.
        version: String,
        /// Target platform (defaults to the current host).
        #[arg(long)]
        platform: Option<String>,
    },
    /// Pull an artifact reference into the cache.
    Pull {
        /// Artifact reference (`registry/repo:tag` or `@digest`).
        reference: String,
        /// Expected digest of the primary blob.
        #[arg(long)]
        digest: Option<String>,
    },
    /// List the tags bound in a repository.
    Tags {
        /// Registry host.
        registry: String,
        /// Repository path.
        repository: String,
    },
    /// Show the cached metadata record for a reference.
    Info {
        /// Artifact reference.
        reference: String,
    },
    /// Remove cached blobs and metadata.
    ClearCache {
        /// Only remove entries older than this many days.
        #[arg(long)]
        older_than_days: Option<u64>,
    },
    /// Materialise a BSR module's proto tree.
    Bsr {
        /// Module coordinate (`registry/owner/module[:version]`).
        coordinate: String,
    },
    /// Publish a directory of files as an OCI artifact.
    Publish {
        /// Directory whose files become the artifact layers.
        dir: PathBuf,
        /// Tagged target reference.
        reference: String,
        /// Additional tags to bind.
        #[arg(long = "tag")]
        extra_tags: Vec<String>,
        /// Pull the artifact back after pushing and verify it byte-for-byte.
        #[arg(long)]
        verify: bool,
        /// Reject the publish unless the tag is a version strictly greater
        /// than the latest already in the repository.
        #[arg(long)]
        require_newer_version: bool,
        /// Webhook to notify after a successful publish.
        #[arg(long)]
        notify_webhook: Option<String>,
    },
    /// Analyse schema changes and plan the next version.
    PlanVersion {
        /// Directory holding the current proto files.
        current: PathBuf,
        /// Directory holding the baseline proto files.
        #[arg(long)]
        baseline: Option<PathBuf>,
        /// The current released version.
        #[arg(long)]
        current_version: Option<String>,
        /// buf binary for breaking-change detection.
        #[arg(long)]
        buf: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e.exit_code();
            eprintln!("{:?}", miette::Report::new(e));
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let layout = CacheLayout::from_env();
    match cli.command {
        Command::Resolve {
            tool,
            version,
            platform,
        } => {
            let platform = match platform {
                Some(s) => Platform::parse(&s)
                    .ok_or_else(|| Error::config_invalid(format!("unknown platform '{s}'")))?,
                None => Platform::current(),
            };
            let resolver = Resolver::new(&layout)?;
            let request = ResolveRequest::for_platform(Tool::from_name(&tool), version, platform);
            let path = resolver.resolve(&request).await?;
            println!("{}", path.display());
        }
        Command::Pull { reference, digest } => {
            let artifact_ref = ArtifactRef::parse(&reference)?;
            let expected = digest.as_deref().map(protodist_core::Digest::parse).transpose()?;
            let client = client(&layout)?;
            let cache = DigestCache::new(layout.blob_dir());
            let metadata = MetadataStore::new(layout.metadata_dir());
            let path = client
                .pull(&artifact_ref, expected.as_ref(), None, &cache, &metadata)
                .await?;
            println!("{}", path.display());
        }
        Command::Tags {
            registry,
            repository,
        } => {
            let client = client(&layout)?;
            for tag in client.list_tags(&registry, &repository).await? {
                println!("{tag}");
            }
        }
        Command::Info { reference } => {
            let artifact_ref = ArtifactRef::parse(&reference)?;
            let metadata = MetadataStore::new(layout.metadata_dir());
            match metadata.read(&artifact_ref)? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => println!("{{\n  \"cached\": false\n}}"),
            }
        }
        Command::ClearCache { older_than_days } => {
            let cache = DigestCache::new(layout.blob_dir());
            let metadata = MetadataStore::new(layout.metadata_dir());
            let blobs = cache.clear_older_than(older_than_days)?;
            let records =
                metadata.clear_older_than(older_than_days)? + metadata.prune_orphans(&cache)?;
            println!("cleared {blobs} blobs, {records} metadata records");
        }
        Command::Bsr { coordinate } => {
            let module = ModuleRef::parse(&coordinate)?;
            let resolver = BsrResolver::new(&layout, client(&layout)?);
            let tree = resolver.resolve(&module).await?;
            println!("{}", tree.display());
        }
        Command::Publish {
            dir,
            reference,
            extra_tags,
            verify,
            require_newer_version,
            notify_webhook,
        } => {
            let artifact_ref = ArtifactRef::parse(&reference)?;
            let client = Arc::new(client(&layout)?);

            if require_newer_version {
                let tag = artifact_ref
                    .tag()
                    .ok_or_else(|| Error::config_invalid("publish target must be tagged"))?;
                let candidate: Version = tag.parse()?;
                let tags = client
                    .list_tags(artifact_ref.registry(), artifact_ref.repository())
                    .await
                    .unwrap_or_default();
                let mut targets = std::collections::BTreeMap::new();
                targets.insert(artifact_ref.registry().to_string(), latest_in_tags(&tags));
                protodist_version::ensure_greater(&candidate, &targets)?;
            }

            let files = collect_dir(&dir)?;
            let options = PublishOptions {
                extra_tags,
                verify_roundtrip: verify,
                ..PublishOptions::default()
            };
            let publisher = Publisher::new(client);
            let digest = publisher.publish(&files, &artifact_ref, &options).await?;
            println!("{digest}");

            if let Some(webhook) = notify_webhook {
                let dispatcher =
                    Dispatcher::new(vec![Arc::new(WebhookChannel::new(Some(webhook)))]);
                dispatcher
                    .dispatch(&ChangeNotification {
                        repository: artifact_ref.repository().to_string(),
                        old_version: None,
                        new_version: artifact_ref.tag().unwrap_or_default().to_string(),
                        bump: "publish".to_string(),
                        changes: files.iter().map(|f| f.title.clone()).collect(),
                        priority: Priority::Normal,
                    })
                    .await;
            }
        }
        Command::PlanVersion {
            current,
            baseline,
            current_version,
            buf,
        } => {
            let mut analyzer = VersionAnalyzer::new();
            if let Some(buf) = buf {
                analyzer = analyzer.with_buf_program(buf);
            }
            let current_version = current_version
                .as_deref()
                .map(str::parse::<Version>)
                .transpose()?;
            let plan = analyzer
                .analyze(&current, baseline.as_deref(), current_version.as_ref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
    }
    Ok(())
}

fn client(layout: &CacheLayout) -> Result<RegistryClient> {
    RegistryClient::new(CredentialStore::new(layout))
}
