use crate::datatypes::{read_u16, FormId, Signature};
use crate::utils::EspError;
use std::io::{Cursor, Read};

/// 子记录结构
#[derive(Debug, Clone)]
pub struct Subrecord {
    /// 4字符子记录签名
    pub signature: Signature,
    /// 原始数据
    pub data: Vec<u8>,
}

impl Subrecord {
    /// 解析子记录
    pub fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self, EspError> {
        // 检查是否有足够的数据读取头部
        if cursor.position() + 6 > cursor.get_ref().len() as u64 {
            return Err(EspError::Corrupt(
                "Insufficient data for subrecord header".into(),
            ));
        }

        let mut signature = [0u8; 4];
        cursor.read_exact(&mut signature)?;

        let size = read_u16(cursor)?;

        if cursor.position() + size as u64 > cursor.get_ref().len() as u64 {
            return Err(EspError::Corrupt(format!(
                "Insufficient data for subrecord data: expected {} bytes",
                size
            )));
        }

        let mut data = vec![0u8; size as usize];
        cursor.read_exact(&mut data)?;

        Ok(Subrecord { signature, data })
    }

    pub fn new(signature: Signature, data: Vec<u8>) -> Self {
        Subrecord { signature, data }
    }

    /// 序列化为磁盘格式（签名 + u16大小 + 数据）
    pub fn dump(&self, output: &mut Vec<u8>) {
        output.extend_from_slice(&self.signature);
        output.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        output.extend_from_slice(&self.data);
    }

    /// 序列化后的总字节数
    pub fn dump_size(&self) -> usize {
        6 + self.data.len()
    }

    /// 数据前4字节作为FormID（携带引用的子记录）
    pub fn fid(&self) -> Option<FormId> {
        if self.data.len() >= 4 {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&self.data[..4]);
            Some(FormId(u32::from_le_bytes(raw)))
        } else {
            None
        }
    }
}
