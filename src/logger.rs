use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record};
use serde::Deserialize;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

/// 日志配置
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: LogLevel,
    pub show_timestamp: bool,
    /// 显示 target（模块路径）
    pub show_module: bool,
    /// 仅对终端输出生效
    pub use_color: bool,
    pub output: LogOutput,
}

/// 日志输出目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    File(PathBuf),
    /// 同时输出到标准输出和文件
    Both(PathBuf),
    /// 按大小轮转的文件，备份依次命名为 `<path>.1`、`<path>.2` ...
    RotatingFile {
        path: PathBuf,
        max_size: u64,
        max_backups: usize,
    },
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" => Ok(LogLevel::Off),
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("未知的日志级别: {}", other)),
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(value: String) -> Result<Self, String> {
        value.parse()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        };
        f.write_str(name)
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            show_timestamp: true,
            show_module: true,
            use_color: true,
            output: LogOutput::Stdout,
        }
    }
}

impl LogConfig {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    pub fn with_timestamp(mut self, show: bool) -> Self {
        self.show_timestamp = show;
        self
    }

    pub fn with_module(mut self, show: bool) -> Self {
        self.show_module = show;
        self
    }

    pub fn with_color(mut self, use_color: bool) -> Self {
        self.use_color = use_color;
        self
    }

    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }
}

/// 追加写入的日志文件，可选按大小轮转
struct LogFile {
    file: File,
    path: PathBuf,
    size: u64,
    rotation: Option<(u64, usize)>,
}

impl LogFile {
    fn open(path: &Path, rotation: Option<(u64, usize)>) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
            rotation,
        })
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        if let Some((max_size, max_backups)) = self.rotation {
            if self.size > 0 && self.size + line.len() as u64 > max_size {
                self.rotate(max_backups)?;
            }
        }
        self.file.write_all(line.as_bytes())?;
        self.size += line.len() as u64;
        Ok(())
    }

    fn rotate(&mut self, max_backups: usize) -> io::Result<()> {
        self.file.flush()?;

        if max_backups == 0 {
            self.file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            self.size = 0;
            return Ok(());
        }

        let _ = std::fs::remove_file(self.backup_path(max_backups));
        for index in (1..max_backups).rev() {
            let from = self.backup_path(index);
            if from.exists() {
                std::fs::rename(&from, self.backup_path(index + 1))?;
            }
        }
        std::fs::rename(&self.path, self.backup_path(1))?;

        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.size = 0;
        Ok(())
    }
}

struct TunnelLogger {
    config: LogConfig,
    file: Option<Mutex<LogFile>>,
}

impl TunnelLogger {
    fn new(config: LogConfig) -> io::Result<Self> {
        let file = match &config.output {
            LogOutput::Stdout => None,
            LogOutput::File(path) | LogOutput::Both(path) => Some(LogFile::open(path, None)?),
            LogOutput::RotatingFile {
                path,
                max_size,
                max_backups,
            } => Some(LogFile::open(path, Some((*max_size, *max_backups)))?),
        };
        Ok(Self {
            config,
            file: file.map(Mutex::new),
        })
    }

    fn to_stdout(&self) -> bool {
        matches!(self.config.output, LogOutput::Stdout | LogOutput::Both(_))
    }

    fn format(&self, record: &Record, color: bool) -> String {
        let mut line = String::new();
        if self.config.show_timestamp {
            line.push_str(&format!("[{}] ", Local::now().format("%Y-%m-%d %H:%M:%S%.3f")));
        }

        let level = format!("{:<5}", record.level());
        if color {
            let code = match record.level() {
                log::Level::Error => 31,
                log::Level::Warn => 33,
                log::Level::Info => 32,
                log::Level::Debug => 36,
                log::Level::Trace => 35,
            };
            line.push_str(&format!("\x1b[{}m{}\x1b[0m", code, level));
        } else {
            line.push_str(&level);
        }

        if self.config.show_module {
            line.push_str(&format!(" [{}]", record.target()));
        }
        line.push_str(&format!(" {}", record.args()));
        line
    }
}

impl Log for TunnelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.config.level.to_level_filter()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        if self.to_stdout() {
            println!("{}", self.format(record, self.config.use_color));
        }

        // 文件里不写颜色控制符
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_line(&format!("{}\n", self.format(record, false)));
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.file.flush();
            }
        }
    }
}

/// 安装全局日志器，只能调用一次
pub fn init_logger(config: LogConfig) -> anyhow::Result<()> {
    let level = config.level.to_level_filter();
    let logger = TunnelLogger::new(config)
        .map_err(|e| anyhow::anyhow!("无法创建日志文件: {}", e))?;

    log::set_boxed_logger(Box::new(logger))
        .map_err(|e| anyhow::anyhow!("设置日志器失败: {}", e))?;
    log::set_max_level(level);
    Ok(())
}

/// 按 `RUST_LOG` 初始化（未设置时为 info），输出格式与 `init_logger` 一致
///
/// ```bash
/// RUST_LOG=debug ./tunnel-socks config.json
/// RUST_LOG=tunnel_socks::decision=info,warn ./tunnel-socks
/// ```
pub fn init_from_env() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {:<5} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init()
        .map_err(|e| anyhow::anyhow!("设置日志器失败: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tunnel-socks-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir.join("app.log")
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("ERROR".parse::<LogLevel>(), Ok(LogLevel::Error));
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert_eq!(" debug ".parse::<LogLevel>(), Ok(LogLevel::Debug));
        assert!("verbose".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Trace.to_string(), "trace");
        assert_eq!(LogLevel::Off.to_level_filter(), LevelFilter::Off);
    }

    #[test]
    fn test_try_from_string() {
        assert_eq!(LogLevel::try_from("Trace".to_string()), Ok(LogLevel::Trace));
        assert!(LogLevel::try_from(String::new()).is_err());
    }

    #[test]
    fn test_env_logger_installs_once() {
        // 全局日志器只能安装一次，第二次必然失败
        let _ = init_from_env();
        assert!(init_from_env().is_err());
        log::info!("env_logger 已安装");
    }

    #[test]
    fn test_log_level_deserialize() {
        let level: LogLevel = serde_json::from_str("\"Info\"").unwrap();
        assert_eq!(level, LogLevel::Info);
        assert!(serde_json::from_str::<LogLevel>("\"loud\"").is_err());
    }

    #[test]
    fn test_format_without_timestamp() {
        let logger = TunnelLogger::new(
            LogConfig::new(LogLevel::Info)
                .with_timestamp(false)
                .with_color(false),
        )
        .unwrap();

        let args = format_args!("规则已加载");
        let record = Record::builder()
            .args(args)
            .level(log::Level::Info)
            .target("tunnel_socks::rules")
            .build();
        assert_eq!(logger.format(&record, false), "INFO  [tunnel_socks::rules] 规则已加载");
    }

    #[test]
    fn test_level_filter() {
        let logger = TunnelLogger::new(LogConfig::new(LogLevel::Warn)).unwrap();
        let warn = Metadata::builder().level(log::Level::Warn).build();
        let info = Metadata::builder().level(log::Level::Info).build();
        assert!(logger.enabled(&warn));
        assert!(!logger.enabled(&info));
    }

    #[test]
    fn test_rotating_file() {
        let path = temp_log_path("rotate");
        let mut file = LogFile::open(&path, Some((8, 2))).unwrap();
        file.write_line("one\n").unwrap();
        file.write_line("two-two\n").unwrap();
        file.write_line("three\n").unwrap();
        file.file.flush().unwrap();

        let read = |p: PathBuf| std::fs::read_to_string(p).unwrap();
        assert_eq!(read(path.clone()), "three\n");
        assert_eq!(read(file.backup_path(1)), "two-two\n");
        assert_eq!(read(file.backup_path(2)), "one\n");

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
