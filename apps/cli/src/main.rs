use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{pin_mut, StreamExt};
use tracing::info;

use redink_core_sdk::config::{AppConfig, ProviderPatch};
use redink_core_sdk::llm::BatchEvent;
use redink_core_sdk::models::{
    HistoryImages, HistoryPatch, ListFilter, NewHistory, Outline, RecordStatus, ReferenceImage,
    ServiceKind,
};
use redink_core_sdk::server::{self, AppState};
use redink_core_sdk::{db, telemetry};

/**
 * \brief RedInk 命令行：配置 Provider、生成大纲与配图、管理历史记录。
 */
#[derive(Parser, Debug)]
#[command(name = "redink", version, about = "RedInk 小红书图文生成工具")]
struct Cli {
    /** \brief SQLite 数据库路径，缺省取 REDINK_DB_PATH 或 redink.db */
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /** \brief 同时写入 logs/redink.log */
    #[arg(long, global = true, default_value_t = false)]
    log_file: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 新增或更新 Provider 配置并设为当前 Provider。
     */
    Init {
        /** \brief text 或 image */
        #[arg(long, default_value = "text", value_parser = ["text", "image"])]
        service: String,
        #[arg(long, default_value = "openai")]
        name: String,
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value_t = false)]
        no_activate: bool,
    },

    /**
     * \brief 根据主题生成大纲。
     */
    Outline {
        #[arg(long)]
        topic: String,
        /** \brief 参考图片文件 */
        #[arg(long = "reference")]
        references: Vec<PathBuf>,
        /** \brief 保存为历史记录 */
        #[arg(long, default_value_t = false)]
        save: bool,
    },

    /**
     * \brief 为一段内容生成单张配图。
     */
    Image {
        #[arg(long)]
        content: String,
        #[arg(long = "reference")]
        references: Vec<PathBuf>,
    },

    /**
     * \brief 为历史记录中的全部页面逐页生成配图。
     */
    Images {
        #[arg(long)]
        id: String,
    },

    /**
     * \brief 历史记录管理。
     */
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /**
     * \brief 启动本地 HTTP 服务并提供前端页面。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5173")]
        addr: String,
    },
}

#[derive(Subcommand, Debug)]
enum HistoryAction {
    List {
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        page_size: u32,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        keyword: Option<String>,
    },
    Show {
        id: String,
    },
    Delete {
        id: String,
    },
    Stats,
}

fn read_references(paths: &[PathBuf]) -> Result<Vec<ReferenceImage>> {
    paths
        .iter()
        .map(|path| {
            let data = std::fs::read(path)
                .with_context(|| format!("read reference image {} failed", path.display()))?;
            let mime = match path.extension().and_then(|e| e.to_str()).map(str::to_lowercase) {
                Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
                Some(ext) if ext == "webp" => "image/webp",
                _ => "image/png",
            };
            Ok(ReferenceImage::new(data, mime))
        })
        .collect()
}

fn parse_service(raw: &str) -> ServiceKind {
    if raw == "image" {
        ServiceKind::Image
    } else {
        ServiceKind::Text
    }
}

/**
 * \brief 把 init 参数合并进已保存的配置并写回；不叠加环境变量。
 */
fn save_provider(
    db_path: &Path,
    kind: ServiceKind,
    name: &str,
    patch: ProviderPatch,
    activate: bool,
) -> Result<AppConfig> {
    let conn = db::open_db(db_path)
        .with_context(|| format!("open database {} failed", db_path.display()))?;
    let mut config = db::load_app_config(&conn).context("load config failed")?;
    config.upsert_provider(kind, name, patch);
    if activate {
        config.activate_provider(kind, name)?;
    }
    db::save_app_config(&conn, &config).context("save config failed")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.log_file).context("init logging failed")?;

    let db_path = cli
        .db
        .or_else(|| std::env::var("REDINK_DB_PATH").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(AppConfig::default().persistence.db_path));

    if let Commands::Init {
        service,
        name,
        api_key,
        base_url,
        model,
        no_activate,
    } = &cli.command
    {
        let kind = parse_service(service);
        let patch = ProviderPatch {
            api_key: api_key.clone(),
            base_url: base_url.clone(),
            model: model.clone(),
            high_concurrency: None,
        };
        let config = save_provider(&db_path, kind, name, patch, !no_activate)?;
        let saved = &config.service(kind).providers[name.as_str()];
        println!(
            "Saved {} provider {} ({} | {})",
            service, name, saved.base_url, saved.model
        );
        return Ok(());
    }

    let conn = db::open_db(&db_path)
        .with_context(|| format!("open database {} failed", db_path.display()))?;
    let mut config = db::load_app_config(&conn).context("load config failed")?;
    // 环境变量只作用于本次运行，不写回数据库
    config.apply_env();
    let conn = Arc::new(Mutex::new(conn));

    let state = AppState::new(conn, config).context("build application state failed")?;
    let notices = state.notices.clone();

    match cli.command {
        Commands::Init { .. } => {}
        Commands::Outline {
            topic,
            references,
            save,
        } => {
            let images = read_references(&references)?;
            let settings = state.config.read().await.active(ServiceKind::Text)?.settings;
            let outline = state
                .generator
                .generate_outline(&settings, &topic, &images)
                .await
                .context("generate outline failed")?;
            for page in &outline.pages {
                println!("[{}] {:?}\n{}\n", page.index, page.page_type, page.content);
            }
            if save {
                let id = state
                    .history
                    .create(NewHistory {
                        title: topic,
                        outline: Outline {
                            raw: outline.raw,
                            pages: outline.pages,
                        },
                        task_id: None,
                    })
                    .await
                    .context("save history failed")?;
                println!("Saved history id={}", id);
            }
        }
        Commands::Image {
            content,
            references,
        } => {
            let images = read_references(&references)?;
            let settings = state.config.read().await.active(ServiceKind::Image)?.settings;
            let url = state
                .generator
                .generate_image(&settings, &content, &images)
                .await
                .context("generate image failed")?;
            println!("{}", url);
        }
        Commands::Images { id } => {
            let record = state
                .history
                .read(&id)
                .await?
                .with_context(|| format!("history {} not found", id))?;
            let settings = state.config.read().await.active(ServiceKind::Image)?.settings;
            state
                .history
                .update(
                    &id,
                    HistoryPatch {
                        status: Some(RecordStatus::Generating),
                        ..Default::default()
                    },
                )
                .await?;

            let mut generated = vec![String::new(); record.outline.pages.len()];
            let events = state
                .generator
                .image_batch(settings, record.outline.pages.clone(), Vec::new());
            pin_mut!(events);
            while let Some(event) = events.next().await {
                match event {
                    BatchEvent::Generating { index } => println!("page {} generating...", index),
                    BatchEvent::Done { index, image_url } => {
                        println!("page {} done: {}", index, image_url);
                        generated[index] = image_url;
                    }
                    BatchEvent::Failed { index, error, .. } => {
                        eprintln!("page {} failed: {}", index, error)
                    }
                }
            }

            let all_done = generated.iter().all(|u| !u.is_empty());
            let thumbnail = generated.iter().find(|u| !u.is_empty()).cloned();
            state
                .history
                .update(
                    &id,
                    HistoryPatch {
                        images: Some(HistoryImages {
                            task_id: record.images.task_id.clone(),
                            generated,
                        }),
                        status: Some(if all_done {
                            RecordStatus::Completed
                        } else {
                            RecordStatus::Error
                        }),
                        thumbnail: Some(thumbnail),
                        ..Default::default()
                    },
                )
                .await
                .context("update history failed")?;
        }
        Commands::History { action } => match action {
            HistoryAction::List {
                page,
                page_size,
                status,
                keyword,
            } => {
                let status = match status.as_deref() {
                    Some(raw) => match RecordStatus::parse(raw) {
                        Some(s) => Some(s),
                        None => bail!("unknown status: {}", raw),
                    },
                    None => None,
                };
                let result = state
                    .history
                    .list(page, page_size, ListFilter { status, keyword })
                    .await
                    .context("list history failed")?;
                for r in &result.records {
                    println!(
                        "{}  {:<10}  {:>2} pages  {}",
                        r.id,
                        r.status.as_str(),
                        r.page_count,
                        r.title
                    );
                }
                println!(
                    "page {}/{} ({} records)",
                    result.page, result.total_pages, result.total
                );
            }
            HistoryAction::Show { id } => {
                let record = state
                    .history
                    .read(&id)
                    .await?
                    .with_context(|| format!("history {} not found", id))?;
                println!("{}", serde_json::to_string_pretty(&record)?);
            }
            HistoryAction::Delete { id } => {
                state.history.delete(&id).await.context("delete history failed")?;
                println!("Deleted {}", id);
            }
            HistoryAction::Stats => {
                let stats = state.history.stats().await?;
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
        },
        Commands::Serve { addr } => {
            info!(backend = state.history.backend(), "starting server");
            server::run(&addr, state).await?;
        }
    }

    for notice in notices.drain() {
        eprintln!("[{:?}] {}", notice.level, notice.message);
    }
    Ok(())
}
