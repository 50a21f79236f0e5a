use bucketsync_lib::commands;
use bucketsync_lib::commands::directory::DirOptions;
use bucketsync_lib::config::CONFIG_FILE;
use bucketsync_lib::logging::init_logging;
use bucketsync_lib::AppState;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "bucketsync", version, about = "本地目录与对象存储之间的增量同步")]
struct Cli {
    /// 配置文件路径（默认在用户配置目录）
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 在控制台输出调试日志
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct BatchArgs {
    /// 按修改日期组织为 YYYY/MM/DD/文件名
    #[arg(long)]
    sort_by_date: bool,
    /// 扩展名白名单（逗号分隔），默认读取配置
    #[arg(long, value_delimiter = ',')]
    ext: Vec<String>,
}

impl From<BatchArgs> for DirOptions {
    fn from(args: BatchArgs) -> Self {
        Self {
            sort_by_date: args.sort_by_date,
            extensions: args.ext,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// 上传单个文件
    Upload {
        file: PathBuf,
        /// 对象键，默认使用文件名
        #[arg(short, long)]
        key: Option<String>,
    },
    /// 下载单个对象
    Download { key: String, file: PathBuf },
    /// 删除单个对象
    Delete { key: String },
    /// 上传整个目录
    UploadDir {
        dir: PathBuf,
        /// 对象键前缀
        #[arg(short, long)]
        prefix: Option<String>,
        #[command(flatten)]
        batch: BatchArgs,
    },
    /// 下载前缀下的所有对象
    DownloadDir {
        prefix: String,
        dir: PathBuf,
        #[command(flatten)]
        batch: BatchArgs,
    },
    /// 删除前缀下的所有对象
    DeleteDir {
        prefix: String,
        /// 只删除这些扩展名（逗号分隔），默认读取配置
        #[arg(long, value_delimiter = ',')]
        ext: Vec<String>,
    },
    /// 列出远程对象
    List {
        #[arg(short, long)]
        prefix: Option<String>,
    },
    /// 显示同步计划，不做任何修改
    Plan,
    /// 执行一次同步
    Sync,
    /// 按间隔持续同步
    Monitor {
        /// 轮询间隔（秒），默认读取配置
        #[arg(short, long)]
        interval: Option<u64>,
    },
    /// 最近的运行记录
    History {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// 显示当前配置
    Config,
    /// 创建默认配置文件
    Init {
        /// 本地同步目录
        #[arg(long)]
        local_root: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Command::Init { local_root } = &cli.command {
        let path = cli
            .config
            .clone()
            .unwrap_or_else(|| AppState::default_config_dir().join(CONFIG_FILE));
        return commands::config::init(&path, local_root.as_deref());
    }

    let state = AppState::load(cli.config)?;
    let _guard = init_logging(&state.config.log, &state.log_dir(), cli.verbose);

    match cli.command {
        Command::Upload { file, key } => commands::object::upload(&state, &file, key).await,
        Command::Download { key, file } => commands::object::download(&state, &key, &file).await,
        Command::Delete { key } => commands::object::delete(&state, &key).await,
        Command::UploadDir { dir, prefix, batch } => {
            commands::directory::upload_dir(&state, &dir, prefix.as_deref(), &batch.into()).await
        }
        Command::DownloadDir { prefix, dir, batch } => {
            commands::directory::download_dir(&state, &prefix, &dir, &batch.into()).await
        }
        Command::DeleteDir { prefix, ext } => {
            let options = DirOptions {
                extensions: ext,
                ..Default::default()
            };
            commands::directory::delete_dir(&state, &prefix, &options).await
        }
        Command::List { prefix } => commands::object::list(&state, prefix).await,
        Command::Plan => commands::sync::plan(&state).await,
        Command::Sync => commands::sync::sync_once(&state).await,
        Command::Monitor { interval } => commands::sync::monitor(&state, interval).await,
        Command::History { limit } => commands::sync::history(&state, limit).await,
        Command::Config => commands::config::show(&state),
        Command::Init { .. } => Ok(()),
    }
}
