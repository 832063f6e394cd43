use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use sealkv_core::{StoreManager, StoreOptions};

mod article;

use crate::article::{Article, ArticleManager};

const SECRET_ENV: &str = "SEALKV_SECRET";

#[derive(Parser, Debug)]
#[command(author, version, about = "Encrypted bucket/key/value store", long_about = None)]
struct Cli {
    #[command(flatten)]
    store: StoreArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct StoreArgs {
    /// JSON store options (name, dir, batch_mode, buckets)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding the store file
    #[arg(long, global = true)]
    dir: Option<PathBuf>,
    /// Store file name
    #[arg(long, global = true)]
    name: Option<String>,
    /// Extra bucket to create on open (repeatable)
    #[arg(long = "bucket", global = true)]
    buckets: Vec<String>,
    /// Store values unencrypted
    #[arg(long, global = true)]
    plain: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(flatten)]
    Store(StoreCommand),
    /// Manage articles
    #[command(subcommand)]
    Article(ArticleCommand),
}

#[derive(Subcommand, Debug)]
enum StoreCommand {
    /// Store a JSON value under a key
    Put {
        bucket: String,
        key: String,
        /// JSON text, e.g. '{"a": 1}' or '"text"'
        value: String,
    },
    /// Print the value of the first key starting with KEY
    Get { bucket: String, key: String },
    /// Print every value whose key starts with PREFIX
    Scan {
        bucket: String,
        #[arg(default_value = "")]
        prefix: String,
    },
    /// List keys starting with PREFIX
    Keys {
        bucket: String,
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Remove a key
    Delete { bucket: String, key: String },
}

#[derive(Subcommand, Debug)]
enum ArticleCommand {
    /// Create an article
    New {
        title: String,
        #[arg(long, default_value = "")]
        content: String,
        /// Marked-up content
        #[arg(long, default_value = "")]
        mark: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// List articles, most recently updated first
    List,
    /// Show one article
    Show { id: String },
    /// Change fields of an existing article
    Update {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        content: Option<String>,
        #[arg(long)]
        mark: Option<String>,
        /// Replaces all tags when given
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    /// Delete an article
    Delete { id: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let secret = read_secret(cli.store.plain)?;
    match cli.command {
        Commands::Article(command) => {
            let options = store_options(&cli.store, None)?;
            let articles = ArticleManager::open(options, secret.as_bytes())?;
            article_command(&articles, command)
        }
        Commands::Store(command) => {
            let options = store_options(&cli.store, Some(command_bucket(&command)))?;
            let store = StoreManager::create(options, secret.as_bytes())?;
            info!(path = %store.path().display(), "store ready");
            store_command(&store, command)
        }
    }
}

fn command_bucket(command: &StoreCommand) -> &str {
    match command {
        StoreCommand::Put { bucket, .. }
        | StoreCommand::Get { bucket, .. }
        | StoreCommand::Scan { bucket, .. }
        | StoreCommand::Keys { bucket, .. }
        | StoreCommand::Delete { bucket, .. } => bucket,
    }
}

/// Options file first, then flags on top. `extra_bucket` is created on open.
fn store_options(args: &StoreArgs, extra_bucket: Option<&str>) -> Result<StoreOptions> {
    let mut options = match &args.config {
        Some(path) => StoreOptions::load(path)
            .with_context(|| format!("loading store options from {}", path.display()))?,
        None => StoreOptions::default(),
    };
    if let Some(dir) = &args.dir {
        options.dir = dir.clone();
    }
    if let Some(name) = &args.name {
        options.name = name.clone();
    }
    for bucket in args.buckets.iter().map(String::as_str).chain(extra_bucket) {
        if !options.buckets.iter().any(|b| b == bucket) {
            options.buckets.push(bucket.to_string());
        }
    }
    Ok(options)
}

fn read_secret(plain: bool) -> Result<Zeroizing<String>> {
    if plain {
        return Ok(Zeroizing::new(String::new()));
    }
    if let Ok(secret) = std::env::var(SECRET_ENV) {
        if !secret.is_empty() {
            return Ok(Zeroizing::new(secret));
        }
    }
    let secret =
        rpassword::prompt_password("Store secret: ").map_err(|e| anyhow!("secret prompt: {e}"))?;
    if secret.is_empty() {
        return Err(anyhow!("empty secret; pass --plain to store values unencrypted"));
    }
    Ok(Zeroizing::new(secret))
}

fn store_command(store: &StoreManager, command: StoreCommand) -> Result<()> {
    match command {
        StoreCommand::Put { bucket, key, value } => {
            let value: Value = serde_json::from_str(&value).context("value is not valid JSON")?;
            store.save(&bucket, &key, &value)?;
            println!("saved {bucket}/{key}");
        }
        StoreCommand::Get { bucket, key } => {
            let value: Value = store
                .get_one_as(&bucket, &key)?
                .ok_or_else(|| anyhow!("{bucket}/{key} not found"))?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        StoreCommand::Scan { bucket, prefix } => {
            let values: Vec<Value> = store.get_by_prefix_as(&bucket, &prefix)?;
            for value in values {
                println!("{value}");
            }
        }
        StoreCommand::Keys { bucket, prefix } => {
            for key in store.get_key_list(&bucket, &prefix)? {
                println!("{key}");
            }
        }
        StoreCommand::Delete { bucket, key } => {
            store.delete(&bucket, &key)?;
            println!("deleted {bucket}/{key}");
        }
    }
    Ok(())
}

fn article_command(articles: &ArticleManager, command: ArticleCommand) -> Result<()> {
    match command {
        ArticleCommand::New {
            title,
            content,
            mark,
            tags,
        } => {
            let article = articles.create(&title, &content, &mark, tags)?;
            println!("{}", article.id);
        }
        ArticleCommand::List => {
            for article in articles.list()? {
                print_summary(&article);
            }
        }
        ArticleCommand::Show { id } => {
            let article = articles
                .get(&id)?
                .ok_or_else(|| anyhow!("article {id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&article)?);
        }
        ArticleCommand::Update {
            id,
            title,
            content,
            mark,
            tags,
        } => {
            let mut article = articles
                .get(&id)?
                .ok_or_else(|| anyhow!("article {id} not found"))?;
            if let Some(title) = title {
                article.title = title;
            }
            if let Some(content) = content {
                article.content = content;
            }
            if let Some(mark) = mark {
                article.content_to_mark = mark;
            }
            if !tags.is_empty() {
                article.tags = tags;
            }
            articles.update(&mut article)?;
            print_summary(&article);
        }
        ArticleCommand::Delete { id } => {
            articles.delete(&id)?;
            println!("deleted {id}");
        }
    }
    Ok(())
}

fn print_summary(article: &Article) {
    println!(
        "{}  {}  {}  [{}]",
        article.id,
        article.updated_at.format("%Y-%m-%d %H:%M"),
        article.title,
        article.tags.join(", ")
    );
}
