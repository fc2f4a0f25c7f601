use crate::datatypes::{read_i32, sig_to_str, FormId, RawString, RecordFlags, Signature};
use crate::headers::{GroupLabel, RecordHeader, HEADER_SIZE};
use crate::masters::{LoadSet, MasterSet};
use crate::subrecord::Subrecord;
use crate::utils::EspError;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::sync::OnceLock;

/// FormID引用表（按记录签名索引，内置JSON数据）
///
/// `fid_links` 列出携带FormID引用的子记录，驱动主文件统计；
/// `merge_filter` 列出过滤合并时允许丢弃的列表型子记录
/// （物品条目、分级列表条目）。普通引用不许被过滤丢弃，
/// 它们引用到未加载主文件时会让整条记录被过滤掉。
#[derive(Debug, Default, serde::Deserialize)]
struct LinkTables {
    fid_links: HashMap<String, Vec<String>>,
    merge_filter: HashMap<String, Vec<String>>,
}

fn link_tables() -> &'static LinkTables {
    static TABLE: OnceLock<LinkTables> = OnceLock::new();
    TABLE.get_or_init(|| {
        serde_json::from_str(include_str!("../data/fid_links.json")).unwrap_or_else(|_e| {
            #[cfg(debug_assertions)]
            eprintln!("警告: 内置 fid_links.json 解析失败: {}", _e);
            LinkTables::default()
        })
    })
}

/// 单元格的块/子块键
///
/// 室内单元格按FormID十进制尾数分桶，室外单元格按网格坐标分桶。
/// 序列化时兄弟单元格按 (块, 子块, FormID) 升序排列。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Bsb {
    Interior { block: u32, sub_block: u32 },
    Exterior { block: (i16, i16), sub_block: (i16, i16) },
}

impl Bsb {
    /// 块组头部标签
    pub fn block_label(&self) -> GroupLabel {
        match *self {
            Bsb::Interior { block, .. } => GroupLabel::Block(block as i32),
            Bsb::Exterior { block: (x, y), .. } => GroupLabel::Grid { y, x },
        }
    }

    /// 子块组头部标签
    pub fn sub_block_label(&self) -> GroupLabel {
        match *self {
            Bsb::Interior { sub_block, .. } => GroupLabel::Block(sub_block as i32),
            Bsb::Exterior {
                sub_block: (x, y), ..
            } => GroupLabel::Grid { y, x },
        }
    }
}

/// 记录结构
///
/// 合并引擎消费的原子单元。保留原始（可能压缩的）负载，
/// 未修改的记录序列化时逐字节回放。
#[derive(Debug, Clone)]
pub struct Record {
    /// 记录头部
    pub header: RecordHeader,
    /// 子记录列表
    pub subrecords: Vec<Subrecord>,
    /// 解压后的原始负载（未压缩记录即磁盘负载）
    raw_data: Vec<u8>,
    /// 压缩记录的原始磁盘负载（含4字节解压大小前缀）
    original_compressed: Option<Vec<u8>>,
    /// 是否已被修改
    is_modified: bool,
}

impl Record {
    /// 解析记录负载（头部已由调用方读取）
    pub fn parse(header: RecordHeader, cursor: &mut Cursor<&[u8]>) -> Result<Self, EspError> {
        if cursor.position() + header.data_size as u64 > cursor.get_ref().len() as u64 {
            return Err(EspError::Corrupt(format!(
                "Insufficient data for record data: expected {} bytes",
                header.data_size
            )));
        }

        let mut data = vec![0u8; header.data_size as usize];
        cursor.read_exact(&mut data)?;

        let (raw_data, original_compressed) =
            if header.flags & RecordFlags::COMPRESSED.bits() != 0 {
                (Self::decompress_data(&data)?, Some(data))
            } else {
                (data, None)
            };

        let subrecords = Self::parse_subrecords(&raw_data)?;

        Ok(Record {
            header,
            subrecords,
            raw_data,
            original_compressed,
            is_modified: false,
        })
    }

    /// 程序化构造记录（补丁生成路径），视为已修改
    pub fn new(
        signature: Signature,
        form_id: FormId,
        flags: u32,
        subrecords: Vec<Subrecord>,
    ) -> Self {
        Record {
            header: RecordHeader {
                signature,
                data_size: 0,
                flags,
                form_id,
                timestamp: 0,
                vc_info: 0,
                internal_version: 0,
                unknown: 0,
            },
            subrecords,
            raw_data: Vec::new(),
            original_compressed: None,
            is_modified: true,
        }
    }

    /// 解压缩数据
    fn decompress_data(data: &[u8]) -> Result<Vec<u8>, EspError> {
        if data.len() < 4 {
            return Err(EspError::CompressionError(
                "压缩数据太短，无法包含解压大小".into(),
            ));
        }

        let mut size_bytes = [0u8; 4];
        size_bytes.copy_from_slice(&data[..4]);
        let decompressed_size = u32::from_le_bytes(size_bytes);

        if decompressed_size == 0 || decompressed_size > 50_000_000 {
            return Err(EspError::CompressionError(format!(
                "解压大小异常: {} bytes",
                decompressed_size
            )));
        }

        let mut decoder = ZlibDecoder::new(&data[4..]);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| EspError::CompressionError(e.to_string()))?;

        if decompressed.len() != decompressed_size as usize {
            return Err(EspError::CompressionError(format!(
                "解压大小不匹配: 期望 {} bytes，实际 {} bytes",
                decompressed_size,
                decompressed.len()
            )));
        }

        Ok(decompressed)
    }

    /// 重新压缩当前子记录
    fn recompress_data(&self) -> Result<Vec<u8>, EspError> {
        let subrecord_data = self.serialize_subrecords();

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&subrecord_data)
            .map_err(|e| EspError::CompressionError(e.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|e| EspError::CompressionError(e.to_string()))?;

        let mut result = Vec::with_capacity(4 + compressed.len());
        result.extend_from_slice(&(subrecord_data.len() as u32).to_le_bytes());
        result.extend_from_slice(&compressed);
        Ok(result)
    }

    fn serialize_subrecords(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for subrecord in &self.subrecords {
            subrecord.dump(&mut out);
        }
        out
    }

    /// 解析子记录
    fn parse_subrecords(data: &[u8]) -> Result<Vec<Subrecord>, EspError> {
        let mut subrecords = Vec::new();
        let mut cursor = Cursor::new(data);

        while cursor.position() < data.len() as u64 {
            let remaining = data.len() as u64 - cursor.position();

            // 子记录最小头部为6字节；更短的尾部仅接受NULL填充
            if remaining < 6 {
                let remaining_bytes = &data[cursor.position() as usize..];
                if remaining_bytes.iter().all(|&b| b == 0) {
                    break;
                }
                return Err(EspError::Corrupt(format!(
                    "记录末尾有 {} 字节非 NULL 数据，无法解析为子记录",
                    remaining
                )));
            }

            subrecords.push(Subrecord::parse(&mut cursor)?);
        }

        Ok(subrecords)
    }

    /// 当前应写出的磁盘负载
    ///
    /// 未修改记录逐字节回放原始负载；已修改记录重新序列化，
    /// 原本压缩的记录重新压缩。
    pub fn payload(&self) -> Result<Cow<'_, [u8]>, EspError> {
        if !self.is_modified {
            return Ok(match &self.original_compressed {
                Some(compressed) => Cow::Borrowed(compressed.as_slice()),
                None => Cow::Borrowed(self.raw_data.as_slice()),
            });
        }
        if self.header.flags & RecordFlags::COMPRESSED.bits() != 0 {
            Ok(Cow::Owned(self.recompress_data()?))
        } else {
            Ok(Cow::Owned(self.serialize_subrecords()))
        }
    }

    /// 负载字节数（不含24字节头部）
    pub fn get_size(&self) -> Result<u32, EspError> {
        Ok(self.payload()?.len() as u32)
    }

    /// 含头部的总字节数
    pub fn total_size(&self) -> Result<u32, EspError> {
        Ok(HEADER_SIZE + self.get_size()?)
    }

    /// 序列化记录（头部 + 负载）
    pub fn dump(&self, output: &mut Vec<u8>) -> Result<(), EspError> {
        let payload = self.payload()?;
        self.header.pack(payload.len() as u32, output);
        output.extend_from_slice(&payload);
        Ok(())
    }

    /// 记录的唯一键
    pub fn group_key(&self) -> FormId {
        self.header.form_id
    }

    pub fn signature(&self) -> &Signature {
        &self.header.signature
    }

    pub fn flags(&self) -> RecordFlags {
        RecordFlags::from_bits_truncate(self.header.flags)
    }

    pub fn is_deleted(&self) -> bool {
        self.flags().contains(RecordFlags::DELETED)
    }

    pub fn is_ignored(&self) -> bool {
        self.flags().contains(RecordFlags::IGNORED)
    }

    /// 常驻单元格标志（世界的常驻CELL靠它识别）
    pub fn is_persistent(&self) -> bool {
        self.flags().contains(RecordFlags::PERSISTENT)
    }

    /// 深拷贝（合并时放入目标树的独立副本）
    pub fn get_type_copy(&self) -> Record {
        self.clone()
    }

    /// 标记为已修改
    pub fn mark_modified(&mut self) {
        self.is_modified = true;
    }

    pub fn is_modified(&self) -> bool {
        self.is_modified
    }

    /// 查找子记录
    pub fn find_subrecord(&self, signature: &Signature) -> Option<&Subrecord> {
        self.subrecords.iter().find(|sr| &sr.signature == signature)
    }

    /// 获取编辑器ID
    pub fn editor_id(&self) -> Option<String> {
        self.find_subrecord(b"EDID")
            .map(|sr| RawString::parse_zstring(&sr.data).content)
    }

    /// 记录引用到的其他FormID
    pub fn linked_fids(&self) -> Vec<FormId> {
        let Some(links) = link_tables().fid_links.get(&sig_to_str(&self.header.signature))
        else {
            return Vec::new();
        };
        self.subrecords
            .iter()
            .filter(|sr| links.iter().any(|l| l.as_bytes() == sr.signature))
            .filter_map(|sr| sr.fid())
            .collect()
    }

    /// 累加记录实际引用到的主文件索引
    pub fn update_masters(&self, acc: &mut MasterSet) {
        acc.add(self.header.form_id.mod_index());
        for fid in self.linked_fids() {
            acc.add(fid.mod_index());
        }
    }

    /// 合并过滤：丢弃引用了未加载主文件的列表型子记录
    ///
    /// 只动过滤表里的子记录（物品/分级列表条目）。普通引用
    /// 原样保留，留给调用方的子集检查去否决整条记录。
    pub fn merge_filter(&mut self, load_set: &LoadSet) {
        let Some(filterable) = link_tables()
            .merge_filter
            .get(&sig_to_str(&self.header.signature))
        else {
            return;
        };
        let before = self.subrecords.len();
        self.subrecords.retain(|sr| {
            if !filterable.iter().any(|l| l.as_bytes() == sr.signature) {
                return true;
            }
            match sr.fid() {
                Some(fid) => load_set.contains(fid.mod_index()),
                None => true,
            }
        });
        if self.subrecords.len() != before {
            self.is_modified = true;
        }
    }

    /// 前一条响应的FormID（INFO记录的PNAM引用）
    pub fn prev_info(&self) -> Option<FormId> {
        self.find_subrecord(b"PNAM").and_then(|sr| sr.fid())
    }

    /// 单元格网格坐标（XCLC子记录，仅室外单元格有）
    pub fn grid(&self) -> Option<(i32, i32)> {
        let sub = self.find_subrecord(b"XCLC")?;
        if sub.data.len() < 8 {
            return None;
        }
        let mut cursor = Cursor::new(&sub.data[..]);
        let x = read_i32(&mut cursor).ok()?;
        let y = read_i32(&mut cursor).ok()?;
        Some((x, y))
    }

    /// 是否室内单元格（DATA子记录标志位）
    pub fn is_interior(&self) -> bool {
        self.find_subrecord(b"DATA")
            .and_then(|sr| sr.data.first())
            .map(|&b| b & 0x01 != 0)
            .unwrap_or(false)
    }

    /// 由锚记录坐标推导的块/子块键
    ///
    /// 室内：FormID对象索引的末两位十进制数字。
    /// 室外：网格坐标按32/8向下取整（负坐标取floor而非截断）。
    pub fn bsb(&self) -> Bsb {
        if self.is_interior() {
            let base = self.header.form_id.object_index();
            Bsb::Interior {
                block: base % 10,
                sub_block: base % 100 / 10,
            }
        } else {
            let (x, y) = self.grid().unwrap_or((0, 0));
            Bsb::Exterior {
                block: (x.div_euclid(32) as i16, y.div_euclid(32) as i16),
                sub_block: (x.div_euclid(8) as i16, y.div_euclid(8) as i16),
            }
        }
    }
}
