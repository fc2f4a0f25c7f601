use crate::datatypes::{
    read_i16, read_i32, read_u16, read_u32, sig_to_str, FormId, Signature,
};
use crate::utils::EspError;
use std::io::{Cursor, Read};

/// 组头部与记录头部统一为24字节
pub const HEADER_SIZE: u32 = 24;

/// 组类型
///
/// 磁盘格式定义的11种组，类型值决定标签字段的解释方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupType {
    /// 顶级组（标签为记录签名）
    Top,
    /// 世界子组（标签为WRLD FormID）
    WorldChildren,
    /// 室内块（标签为块编号）
    InteriorBlock,
    /// 室内子块（标签为子块编号）
    InteriorSubBlock,
    /// 室外块（标签为网格坐标）
    ExteriorBlock,
    /// 室外子块（标签为网格坐标）
    ExteriorSubBlock,
    /// 单元格子组（标签为CELL FormID）
    CellChildren,
    /// 对话子组（标签为DIAL FormID）
    TopicChildren,
    /// 常驻引用桶
    CellPersistent,
    /// 临时引用桶
    CellTemporary,
    /// 远距离引用桶
    CellDistant,
}

impl GroupType {
    /// 转换为i32值
    pub fn to_i32(self) -> i32 {
        match self {
            GroupType::Top => 0,
            GroupType::WorldChildren => 1,
            GroupType::InteriorBlock => 2,
            GroupType::InteriorSubBlock => 3,
            GroupType::ExteriorBlock => 4,
            GroupType::ExteriorSubBlock => 5,
            GroupType::CellChildren => 6,
            GroupType::TopicChildren => 7,
            GroupType::CellPersistent => 8,
            GroupType::CellTemporary => 9,
            GroupType::CellDistant => 10,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0 => GroupType::Top,
            1 => GroupType::WorldChildren,
            2 => GroupType::InteriorBlock,
            3 => GroupType::InteriorSubBlock,
            4 => GroupType::ExteriorBlock,
            5 => GroupType::ExteriorSubBlock,
            6 => GroupType::CellChildren,
            7 => GroupType::TopicChildren,
            8 => GroupType::CellPersistent,
            9 => GroupType::CellTemporary,
            10 => GroupType::CellDistant,
            _ => return None,
        })
    }
}

/// 组标签
///
/// 4字节字段，内容随组类型变化。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GroupLabel {
    /// 记录签名（顶级组）
    Signature(Signature),
    /// 锚记录FormID（世界/单元格/对话子组及引用桶）
    Fid(FormId),
    /// 室内块/子块编号
    Block(i32),
    /// 室外网格坐标（磁盘上y在前）
    Grid { y: i16, x: i16 },
}

impl GroupLabel {
    /// 打包为磁盘上的4字节
    pub fn pack(&self) -> [u8; 4] {
        match *self {
            GroupLabel::Signature(sig) => sig,
            GroupLabel::Fid(fid) => fid.0.to_le_bytes(),
            GroupLabel::Block(n) => n.to_le_bytes(),
            GroupLabel::Grid { y, x } => {
                let mut out = [0u8; 4];
                out[..2].copy_from_slice(&y.to_le_bytes());
                out[2..].copy_from_slice(&x.to_le_bytes());
                out
            }
        }
    }

    /// 按组类型解释4字节标签
    pub fn parse(raw: [u8; 4], group_type: GroupType) -> Self {
        let mut cursor = Cursor::new(&raw[..]);
        match group_type {
            GroupType::Top => GroupLabel::Signature(raw),
            GroupType::WorldChildren
            | GroupType::CellChildren
            | GroupType::TopicChildren
            | GroupType::CellPersistent
            | GroupType::CellTemporary
            | GroupType::CellDistant => GroupLabel::Fid(FormId(u32::from_le_bytes(raw))),
            GroupType::InteriorBlock | GroupType::InteriorSubBlock => {
                GroupLabel::Block(i32::from_le_bytes(raw))
            }
            GroupType::ExteriorBlock | GroupType::ExteriorSubBlock => {
                // read_i16 在 [u8;4] 上不会失败
                let y = read_i16(&mut cursor).unwrap_or(0);
                let x = read_i16(&mut cursor).unwrap_or(0);
                GroupLabel::Grid { y, x }
            }
        }
    }

    /// 标签中的FormID（仅子组标签有）
    pub fn as_fid(&self) -> Option<FormId> {
        match self {
            GroupLabel::Fid(fid) => Some(*fid),
            _ => None,
        }
    }

    /// 标签中的签名（仅顶级组标签有）
    pub fn as_signature(&self) -> Option<Signature> {
        match self {
            GroupLabel::Signature(sig) => Some(*sig),
            _ => None,
        }
    }
}

/// 组头部结构
///
/// size 包含头部自身的24字节及全部后代。
#[derive(Debug, Clone, Copy)]
pub struct GroupHeader {
    pub size: u32,
    pub label: GroupLabel,
    pub group_type: GroupType,
    pub stamp: u16,
    pub vc_info: u16,
    pub unknown: u32,
}

impl GroupHeader {
    pub fn new(size: u32, label: GroupLabel, group_type: GroupType, stamp: u16) -> Self {
        GroupHeader {
            size,
            label,
            group_type,
            stamp,
            vc_info: 0,
            unknown: 0,
        }
    }

    /// 解析组头部（包含GRUP标识在内的24字节）
    pub fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self, EspError> {
        if cursor.position() + HEADER_SIZE as u64 > cursor.get_ref().len() as u64 {
            return Err(EspError::Corrupt(
                "Insufficient data for group header".into(),
            ));
        }

        let mut type_bytes = [0u8; 4];
        cursor.read_exact(&mut type_bytes)?;
        if &type_bytes != b"GRUP" {
            return Err(EspError::Corrupt(format!(
                "Expected GRUP, found {}",
                sig_to_str(&type_bytes)
            )));
        }

        let size = read_u32(cursor)?;

        // 验证组大小是否合理
        if size > 200_000_000 {
            return Err(EspError::Corrupt(format!(
                "组大小异常: {} bytes (可能数据损坏)",
                size
            )));
        }
        if size < HEADER_SIZE {
            return Err(EspError::Corrupt(format!(
                "组大小太小: {} bytes (最小应为{}字节)",
                size, HEADER_SIZE
            )));
        }

        let mut label_raw = [0u8; 4];
        cursor.read_exact(&mut label_raw)?;
        let type_value = read_i32(cursor)?;
        let group_type = GroupType::from_i32(type_value).ok_or(EspError::UnexpectedSubgroup {
            group_type: type_value,
            context: "GRUP header".into(),
        })?;
        let stamp = read_u16(cursor)?;
        let vc_info = read_u16(cursor)?;
        let unknown = read_u32(cursor)?;

        Ok(GroupHeader {
            size,
            label: GroupLabel::parse(label_raw, group_type),
            group_type,
            stamp,
            vc_info,
            unknown,
        })
    }

    /// 打包组头部
    pub fn pack(&self, output: &mut Vec<u8>) {
        output.extend_from_slice(b"GRUP");
        output.extend_from_slice(&self.size.to_le_bytes());
        output.extend_from_slice(&self.label.pack());
        output.extend_from_slice(&self.group_type.to_i32().to_le_bytes());
        output.extend_from_slice(&self.stamp.to_le_bytes());
        output.extend_from_slice(&self.vc_info.to_le_bytes());
        output.extend_from_slice(&self.unknown.to_le_bytes());
    }

    /// 头部之后的数据大小
    pub fn blob_size(&self) -> u32 {
        self.size - HEADER_SIZE
    }

    /// 跳过组数据（不解析）
    pub fn skip_blob(&self, cursor: &mut Cursor<&[u8]>) -> Result<(), EspError> {
        let end = cursor.position() + self.blob_size() as u64;
        if end > cursor.get_ref().len() as u64 {
            return Err(EspError::Corrupt(format!(
                "Insufficient data for group data: expected {} bytes",
                self.blob_size()
            )));
        }
        cursor.set_position(end);
        Ok(())
    }
}

/// 记录头部结构
#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    pub signature: Signature,
    pub data_size: u32,
    pub flags: u32,
    pub form_id: FormId,
    pub timestamp: u16,
    pub vc_info: u16,
    pub internal_version: u16,
    pub unknown: u16,
}

impl RecordHeader {
    /// 解析记录头部（24字节）
    pub fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self, EspError> {
        if cursor.position() + HEADER_SIZE as u64 > cursor.get_ref().len() as u64 {
            return Err(EspError::Corrupt(
                "Insufficient data for record header".into(),
            ));
        }

        let mut signature = [0u8; 4];
        cursor.read_exact(&mut signature)?;

        let data_size = read_u32(cursor)?;
        if data_size > 100_000_000 {
            return Err(EspError::Corrupt(format!(
                "记录 {} 数据大小异常: {} bytes (可能数据损坏)",
                sig_to_str(&signature),
                data_size
            )));
        }

        let flags = read_u32(cursor)?;
        let form_id = FormId::read(cursor)?;
        let timestamp = read_u16(cursor)?;
        let vc_info = read_u16(cursor)?;
        let internal_version = read_u16(cursor)?;
        let unknown = read_u16(cursor)?;

        Ok(RecordHeader {
            signature,
            data_size,
            flags,
            form_id,
            timestamp,
            vc_info,
            internal_version,
            unknown,
        })
    }

    /// 打包记录头部，data_size 以实际写出的负载为准
    pub fn pack(&self, data_size: u32, output: &mut Vec<u8>) {
        output.extend_from_slice(&self.signature);
        output.extend_from_slice(&data_size.to_le_bytes());
        output.extend_from_slice(&self.flags.to_le_bytes());
        output.extend_from_slice(&self.form_id.0.to_le_bytes());
        output.extend_from_slice(&self.timestamp.to_le_bytes());
        output.extend_from_slice(&self.vc_info.to_le_bytes());
        output.extend_from_slice(&self.internal_version.to_le_bytes());
        output.extend_from_slice(&self.unknown.to_le_bytes());
    }

    /// 跳过记录数据（不解析）
    pub fn skip_blob(&self, cursor: &mut Cursor<&[u8]>) -> Result<(), EspError> {
        let end = cursor.position() + self.data_size as u64;
        if end > cursor.get_ref().len() as u64 {
            return Err(EspError::Corrupt(format!(
                "Insufficient data for record data: expected {} bytes",
                self.data_size
            )));
        }
        cursor.set_position(end);
        Ok(())
    }
}

/// 统一头部：组或记录
#[derive(Debug, Clone, Copy)]
pub enum Header {
    Group(GroupHeader),
    Record(RecordHeader),
}

/// 预读4字节签名后恢复位置
///
/// 解析循环靠它区分GRUP与记录，也用于检测组结束后的回退。
pub fn peek_signature(cursor: &mut Cursor<&[u8]>) -> Result<Signature, EspError> {
    let peek_pos = cursor.position();
    let mut peek_bytes = [0u8; 4];
    cursor.read_exact(&mut peek_bytes)?;
    cursor.set_position(peek_pos);
    Ok(peek_bytes)
}

/// 读取下一个头部（组或记录）
pub fn unpack_header(cursor: &mut Cursor<&[u8]>) -> Result<Header, EspError> {
    if &peek_signature(cursor)? == b"GRUP" {
        Ok(Header::Group(GroupHeader::parse(cursor)?))
    } else {
        Ok(Header::Record(RecordHeader::parse(cursor)?))
    }
}
