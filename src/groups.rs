//! 记录组容器
//!
//! 把插件文件的嵌套GRUP结构解析为内存树，支持三种补丁操作
//! （merge/update/keep），再按磁盘布局原样序列化回去。
//! 容器分为惰性未解析块与各解析变体；合并算法的公共部分在
//! `crate::merge` 中，以自由函数形式被各变体复用。

pub mod cell;
pub mod cells;
pub mod dialogue;
pub mod flat;
pub mod top;
pub mod world;

pub use cell::CellGroup;
pub use cells::InteriorCellsGroup;
pub use dialogue::{DialGroup, DialsTopGroup};
pub use flat::RecordGroup;
pub use top::{TopGroup, UnparsedGroup};
pub use world::{WorldGroup, WorldsTopGroup};
