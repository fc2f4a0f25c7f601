use crate::datatypes::FormId;
use std::path::Path;
use thiserror::Error;

/// 自定义错误类型
///
/// 解析期的结构错误对当前文件是致命的，直接向调用方传播；
/// 合并/更新/裁剪算法对数据层面的缺失（键不存在、容器为空）
/// 永远不报错。
#[derive(Error, Debug)]
pub enum EspError {
    #[error("Invalid file format")]
    InvalidFormat,

    #[error("Unexpected {signature} record in {context}")]
    UnexpectedRecord { signature: String, context: String },

    #[error("Duplicate {key} record in {context}")]
    DuplicateRecord { key: String, context: String },

    #[error("Children subgroup ({label}) does not match anchor {anchor}")]
    MismatchedAnchor { label: FormId, anchor: FormId },

    #[error("Unexpected subgroup {group_type} in {context}")]
    UnexpectedSubgroup { group_type: i32, context: String },

    /// dump 前必须先调用 size() 重算组大小
    #[error("Group size not computed before dump (call size() first)")]
    SizeNotComputed,

    #[error("Compression error: {0}")]
    CompressionError(String),

    #[error("{0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl EspError {
    /// 组内出现了接受集之外的记录
    pub fn unexpected_record(sig: &crate::datatypes::Signature, context: impl Into<String>) -> Self {
        EspError::UnexpectedRecord {
            signature: crate::datatypes::sig_to_str(sig),
            context: context.into(),
        }
    }

    /// 初次解析时同一FormID出现了两次
    pub fn duplicate_record(fid: FormId, context: impl Into<String>) -> Self {
        EspError::DuplicateRecord {
            key: fid.to_string(),
            context: context.into(),
        }
    }
}

/// 创建文件备份
pub fn create_backup(file_path: &Path) -> Result<std::path::PathBuf, EspError> {
    if !file_path.exists() {
        return Err(EspError::IoError(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "原文件不存在",
        )));
    }

    let timestamp = chrono::Local::now().format("%Y-%m-%d-%H-%M-%S");
    let backup_path = file_path.with_extension(format!("{}.bak", timestamp));

    std::fs::copy(file_path, &backup_path).map_err(EspError::IoError)?;

    Ok(backup_path)
}
