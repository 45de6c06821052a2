//! 媒体类型、解析模式与标签渲染
//!
//! 标签是写进消息正文的确定性文本，例如：
//! `<image status="loading" filename="a.png" />`、`<audio filename="b.mp3" error="timeout" />`。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::MediaTypeSection;
use crate::memory::ContentBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Document,
}

const AUDIO_EXTS: &[&str] = &["mp3", "wav", "flac", "aac", "ogg", "wma", "amr", "m4a", "opus"];
const VIDEO_EXTS: &[&str] = &["mp4", "avi", "mkv", "mov", "wmv", "flv", "webm", "m4v", "3gp"];
const IMAGE_EXTS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp", "svg", "tiff", "ico"];

impl MediaKind {
    /// 标签名；文档用 `file`
    pub fn tag(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
            MediaKind::Document => "file",
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            MediaKind::Image => "image/png",
            MediaKind::Audio => "audio/mpeg",
            MediaKind::Video => "video/mp4",
            MediaKind::Document => "application/octet-stream",
        }
    }

    /// 有时长、可裁剪
    pub fn is_timed(self) -> bool {
        matches!(self, MediaKind::Audio | MediaKind::Video)
    }

    /// 按扩展名识别通用文件的真实类型，未知扩展名视为文档
    pub fn from_filename(filename: &str) -> Self {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        if AUDIO_EXTS.contains(&ext.as_str()) {
            MediaKind::Audio
        } else if VIDEO_EXTS.contains(&ext.as_str()) {
            MediaKind::Video
        } else if IMAGE_EXTS.contains(&ext.as_str()) {
            MediaKind::Image
        } else {
            MediaKind::Document
        }
    }
}

/// 单个附件的解析方式；transcribe 与 passthrough 同时开启时取 transcribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionMode {
    Transcribe,
    Passthrough,
    Disabled,
}

impl ResolutionMode {
    pub fn select(cfg: &MediaTypeSection) -> Self {
        if cfg.transcribe {
            ResolutionMode::Transcribe
        } else if cfg.passthrough {
            ResolutionMode::Passthrough
        } else {
            ResolutionMode::Disabled
        }
    }
}

/// 附件来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentSource {
    Url(String),
    Path(PathBuf),
}

/// 传输层给出的附件描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub kind: MediaKind,
    pub filename: String,
    pub source: AttachmentSource,
    pub size_bytes: Option<u64>,
}

impl Attachment {
    /// 通用文件按扩展名修正类型
    pub fn normalized_kind(&self) -> MediaKind {
        if self.kind == MediaKind::Document && !self.filename.is_empty() {
            MediaKind::from_filename(&self.filename)
        } else {
            self.kind
        }
    }
}

/// 成功解析的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// 转述文本（已包成 `<tag filename="..">描述</tag>`）
    Text(String),
    /// 透传的内容块
    Block(ContentBlock),
}

fn render(kind: MediaKind, filename: &str, attrs: &[(&str, &str)]) -> String {
    let mut tag = format!("<{}", kind.tag());
    for (key, value) in attrs.iter().filter(|(k, _)| *k == "status") {
        tag.push_str(&format!(" {key}=\"{value}\""));
    }
    if !filename.is_empty() {
        tag.push_str(&format!(" filename=\"{filename}\""));
    }
    for (key, value) in attrs.iter().filter(|(k, _)| *k != "status") {
        tag.push_str(&format!(" {key}=\"{value}\""));
    }
    tag.push_str(" />");
    tag
}

/// 不含内容的引用标签（未开启解析、或透传块的说明文字）
pub fn bare_tag(kind: MediaKind, filename: &str) -> String {
    render(kind, filename, &[])
}

/// 异步解析中的占位标签
pub fn loading_tag(kind: MediaKind, filename: &str) -> String {
    render(kind, filename, &[("status", "loading")])
}

pub fn timeout_tag(kind: MediaKind, filename: &str) -> String {
    render(kind, filename, &[("error", "timeout")])
}

/// 失败标签，code 来自 `ResolutionError::code`
pub fn error_tag(kind: MediaKind, filename: &str, code: &str) -> String {
    render(kind, filename, &[("error", code)])
}

/// 同步解析失败时直接写入正文的占位
pub fn unresolved_tag(kind: MediaKind, filename: &str) -> String {
    render(kind, filename, &[("error", "unresolved")])
}

/// 转述结果：`<tag filename="..">描述</tag>`
pub fn described_tag(kind: MediaKind, filename: &str, description: &str) -> String {
    let tag = kind.tag();
    if filename.is_empty() {
        format!("<{tag}>{description}</{tag}>")
    } else {
        format!("<{tag} filename=\"{filename}\">{description}</{tag}>")
    }
}
