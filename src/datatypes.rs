use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};

// 基础整数类型读取函数
pub fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8, std::io::Error> {
    cursor.read_u8()
}

pub fn read_u16(cursor: &mut Cursor<&[u8]>) -> Result<u16, std::io::Error> {
    cursor.read_u16::<LittleEndian>()
}

pub fn read_i16(cursor: &mut Cursor<&[u8]>) -> Result<i16, std::io::Error> {
    cursor.read_i16::<LittleEndian>()
}

pub fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, std::io::Error> {
    cursor.read_u32::<LittleEndian>()
}

pub fn read_i32(cursor: &mut Cursor<&[u8]>) -> Result<i32, std::io::Error> {
    cursor.read_i32::<LittleEndian>()
}

// 基础整数类型写入函数
pub fn write_u16(writer: &mut dyn Write, value: u16) -> Result<(), std::io::Error> {
    writer.write_u16::<LittleEndian>(value)
}

pub fn write_u32(writer: &mut dyn Write, value: u32) -> Result<(), std::io::Error> {
    writer.write_u32::<LittleEndian>(value)
}

/// 4字符签名(GRUP/CELL/WRLD/...)
pub type Signature = [u8; 4];

/// 签名转字符串（用于错误信息与统计输出）
pub fn sig_to_str(sig: &Signature) -> String {
    String::from_utf8_lossy(sig).into_owned()
}

/// FormID：记录的全局唯一键
///
/// 高8位是主文件索引（在当前加载顺序中解析后的索引），
/// 低24位是对象索引。合并算法全部以它为键。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FormId(pub u32);

impl FormId {
    /// 主文件索引（高字节）
    pub fn mod_index(self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// 对象索引（低24位）
    pub fn object_index(self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    pub fn read(cursor: &mut Cursor<&[u8]>) -> Result<Self, std::io::Error> {
        Ok(FormId(read_u32(cursor)?))
    }
}

impl std::fmt::Display for FormId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

// 支持的编码
const SUPPORTED_ENCODINGS: &[&str] = &["utf-8", "windows-1252", "windows-1250", "windows-1251"];

#[derive(Debug, Clone)]
pub struct RawString {
    pub content: String,
    pub encoding: String,
}

impl RawString {
    /// 尝试多种编码解码
    pub fn decode(data: &[u8]) -> Self {
        for encoding_name in SUPPORTED_ENCODINGS {
            if let Some(encoding) = encoding_rs::Encoding::for_label(encoding_name.as_bytes()) {
                let (decoded, _, had_errors) = encoding.decode(data);
                if !had_errors {
                    return RawString {
                        content: decoded.into_owned(),
                        encoding: encoding_name.to_string(),
                    };
                }
            }
        }

        // 回退到UTF-8，忽略错误
        RawString {
            content: String::from_utf8_lossy(data).into_owned(),
            encoding: "utf-8".to_string(),
        }
    }

    /// Z字符串解析(以null结尾)
    pub fn parse_zstring(data: &[u8]) -> Self {
        let null_pos = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        Self::decode(&data[..null_pos])
    }
}

// 记录标志位定义
bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RecordFlags: u32 {
        const MASTER_FILE = 0x00000001;        // ESM标志
        const DELETED = 0x00000020;            // 已删除
        const LOCALIZED = 0x00000080;          // 本地化
        const LIGHT_MASTER = 0x00000200;       // 轻量级主文件
        const PERSISTENT = 0x00000400;         // 持久化（CELL：常驻单元格）
        const DISABLED = 0x00000800;           // 禁用
        const IGNORED = 0x00001000;            // 忽略（合并时跳过）
        const VISIBLE_DISTANT = 0x00008000;    // 远距离可见
        const COMPRESSED = 0x00040000;         // 压缩
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_form_id_parts() {
        let fid = FormId(0x0301_0C24);
        assert_eq!(fid.mod_index(), 0x03, "高字节应为主文件索引");
        assert_eq!(fid.object_index(), 0x0001_0C24, "低24位应为对象索引");
        assert_eq!(format!("{}", fid), "03010C24");
    }

    #[test]
    fn test_form_id_ordering() {
        let mut fids = vec![FormId(5), FormId(1), FormId(3)];
        fids.sort();
        assert_eq!(fids, vec![FormId(1), FormId(3), FormId(5)]);
    }

    #[test]
    fn test_zstring_decoding() {
        let raw = RawString::parse_zstring(b"Oblivion.esm\0junk");
        assert_eq!(raw.content, "Oblivion.esm");
    }
}
