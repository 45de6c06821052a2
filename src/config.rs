//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ANTLER__*` 覆盖（双下划线表示嵌套，如 `ANTLER__SESSION__TIMEOUT_SUMMARIZE_SECS=600`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::media::MediaKind;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub session: SessionSection,
    pub message: MessageSection,
    pub media: MediaSection,
}

/// [app] 段：应用名、系统提示词路径、对话轮数上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 系统提示词文件，未设置时查找 config/prompts/system.md
    pub system_prompt_path: Option<PathBuf>,
    /// 对话历史保留轮数
    pub max_context_turns: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            system_prompt_path: None,
            max_context_turns: 20,
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / mock；openai 需要 OPENAI_API_KEY
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
    pub transcription: TranscriptionSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            request_timeout_secs: 60,
            transcription: TranscriptionSection::default(),
        }
    }
}

/// [llm.transcription] 段：媒体转述可单独指定模型，未设置时复用主模型
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TranscriptionSection {
    pub model: Option<String>,
    pub base_url: Option<String>,
}

/// [session] 段：两级空闲超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// 无新消息多久后做会话摘要（秒）
    pub timeout_summarize_secs: u64,
    /// 摘要后再空闲多久清空历史（秒）
    pub timeout_clear_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            timeout_summarize_secs: 1800,
            timeout_clear_secs: 3600,
        }
    }
}

impl SessionSection {
    pub fn summarize_after(&self) -> Duration {
        Duration::from_secs(self.timeout_summarize_secs)
    }

    pub fn clear_after(&self) -> Duration {
        Duration::from_secs(self.timeout_clear_secs)
    }
}

/// [message] 段：消息段渲染
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessageSection {
    /// 引用回复的原文超过该字符数时截断并加 "..."
    pub reply_max_length: usize,
}

impl Default for MessageSection {
    fn default() -> Self {
        Self {
            reply_max_length: 50,
        }
    }
}

/// [media] 段：同步处理阈值、异步解析超时、各媒体类型开关
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaSection {
    /// 不超过该大小（MB）且大小已知的附件在入队前同步解析；未设置时全部异步
    pub sync_process_threshold_mb: Option<f64>,
    /// 异步解析超时（秒）
    pub resolve_timeout_secs: u64,
    pub image: MediaTypeSection,
    pub audio: MediaTypeSection,
    pub video: MediaTypeSection,
    pub document: MediaTypeSection,
}

impl Default for MediaSection {
    fn default() -> Self {
        Self {
            sync_process_threshold_mb: Some(1.0),
            resolve_timeout_secs: 300,
            image: MediaTypeSection {
                passthrough: true,
                ..MediaTypeSection::default()
            },
            audio: MediaTypeSection {
                transcribe: true,
                max_duration: 300,
                ..MediaTypeSection::default()
            },
            video: MediaTypeSection {
                transcribe: true,
                max_duration: 60,
                ..MediaTypeSection::default()
            },
            document: MediaTypeSection {
                transcribe: true,
                ..MediaTypeSection::default()
            },
        }
    }
}

impl MediaSection {
    pub fn for_kind(&self, kind: MediaKind) -> &MediaTypeSection {
        match kind {
            MediaKind::Image => &self.image,
            MediaKind::Audio => &self.audio,
            MediaKind::Video => &self.video,
            MediaKind::Document => &self.document,
        }
    }

    pub fn sync_threshold_bytes(&self) -> Option<u64> {
        self.sync_process_threshold_mb
            .filter(|mb| *mb >= 0.0)
            .map(|mb| (mb * 1024.0 * 1024.0) as u64)
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }
}

/// [media.<kind>] 段；transcribe 与 passthrough 同时开启时 transcribe 优先
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MediaTypeSection {
    pub transcribe: bool,
    pub passthrough: bool,
    /// 音视频最长处理时长（秒），0 表示不裁剪
    pub max_duration: u64,
    /// 超长且裁剪失败时是否输出错误标签（false 时输出空标签）
    pub trim_over_limit: bool,
}

impl Default for MediaTypeSection {
    fn default() -> Self {
        Self {
            transcribe: false,
            passthrough: false,
            max_duration: 0,
            trim_over_limit: true,
        }
    }
}

/// 从 config 目录加载配置，环境变量 ANTLER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ANTLER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ANTLER")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
