pub mod datatypes;
pub mod groups;
pub mod headers;
pub mod masters;
pub mod merge;
pub mod plugin;
pub mod record;
pub mod subrecord;
pub mod utils;

// 重新导出主要结构
pub use datatypes::FormId;
pub use groups::{
    CellGroup, DialGroup, DialsTopGroup, InteriorCellsGroup, RecordGroup, TopGroup,
    UnparsedGroup, WorldGroup, WorldsTopGroup,
};
pub use masters::{LoadSet, MasterSet};
pub use merge::{FidSet, MergeState};
pub use plugin::{LoadPolicy, Plugin, PluginStats};
pub use record::Record;
pub use subrecord::Subrecord;
pub use utils::EspError;

// 常量定义
pub const SUPPORTED_EXTENSIONS: &[&str] = &["esp", "esm"];
