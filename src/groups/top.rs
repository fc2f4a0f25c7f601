use crate::datatypes::{sig_to_str, Signature};
use crate::groups::cells::InteriorCellsGroup;
use crate::groups::dialogue::DialsTopGroup;
use crate::groups::flat::RecordGroup;
use crate::groups::world::WorldsTopGroup;
use crate::headers::{unpack_header, GroupHeader, GroupLabel, GroupType, Header, HEADER_SIZE};
use crate::masters::MasterSet;
use crate::merge::{FidSet, MergeState};
use crate::record::Record;
use crate::utils::EspError;
use std::io::Cursor;

/// 惰性未解析组
///
/// 只保存头部和原始字节。不解析就不算变更，序列化时逐字节
/// 回放，未触碰的组保证位级往返。记录计数靠扫描头部，
/// 不物化任何记录。
#[derive(Debug)]
pub struct UnparsedGroup {
    pub header: GroupHeader,
    raw: Vec<u8>,
}

impl UnparsedGroup {
    /// 读入组数据但不分析
    pub fn parse(header: GroupHeader, cursor: &mut Cursor<&[u8]>) -> Result<Self, EspError> {
        let blob_size = header.blob_size() as usize;
        let start = cursor.position() as usize;
        if start + blob_size > cursor.get_ref().len() {
            return Err(EspError::Corrupt(format!(
                "Insufficient data for group data: expected {} bytes",
                blob_size
            )));
        }
        let raw = cursor.get_ref()[start..start + blob_size].to_vec();
        cursor.set_position((start + blob_size) as u64);
        Ok(UnparsedGroup { header, raw })
    }

    /// 缓存的组大小，头部字段原样可信
    pub fn size(&self) -> u32 {
        self.header.size
    }

    /// 逐字节回放
    pub fn dump(&self, output: &mut Vec<u8>) {
        self.header.pack(output);
        output.extend_from_slice(&self.raw);
    }

    /// 扫描头部统计记录数（组自身与嵌套组计入 include_groups）
    pub fn record_count(&self, include_groups: bool) -> Result<usize, EspError> {
        let mut records = 0usize;
        let mut groups = 1usize; // 本组头部
        let mut cursor = Cursor::new(&self.raw[..]);
        while cursor.position() < self.raw.len() as u64 {
            match unpack_header(&mut cursor)? {
                Header::Group(_) => groups += 1,
                Header::Record(rec_head) => {
                    rec_head.skip_blob(&mut cursor)?;
                    records += 1;
                }
            }
        }
        if records == 0 {
            return Ok(0);
        }
        Ok(records + if include_groups { groups } else { 0 })
    }
}

/// 顶级组分发器
///
/// 按顶级组标签选择容器变体：CELL/WRLD/DIAL是复合结构，
/// 其余签名都是平坦记录组；加载策略不要求解析的组整体
/// 作为惰性块携带。
#[derive(Debug)]
pub enum TopGroup {
    Unparsed(UnparsedGroup),
    Records(RecordGroup),
    InteriorCells(InteriorCellsGroup),
    Worlds(WorldsTopGroup),
    Dialogues(DialsTopGroup),
}

impl TopGroup {
    /// 解析一个顶级组（头部已读取）
    pub fn parse(
        header: GroupHeader,
        cursor: &mut Cursor<&[u8]>,
        unpack: bool,
    ) -> Result<Self, EspError> {
        if header.group_type != GroupType::Top {
            return Err(EspError::UnexpectedSubgroup {
                group_type: header.group_type.to_i32(),
                context: "top level".into(),
            });
        }
        let sig = header
            .label
            .as_signature()
            .ok_or_else(|| EspError::Corrupt("Top group without signature label".into()))?;

        if !unpack {
            return Ok(TopGroup::Unparsed(UnparsedGroup::parse(header, cursor)?));
        }
        Ok(match &sig {
            b"CELL" => TopGroup::InteriorCells(InteriorCellsGroup::parse(header, cursor)?),
            b"WRLD" => TopGroup::Worlds(WorldsTopGroup::parse(header, cursor)?),
            b"DIAL" => TopGroup::Dialogues(DialsTopGroup::parse(header, cursor)?),
            _ => TopGroup::Records(RecordGroup::parse(header, vec![sig], cursor)?),
        })
    }

    /// 构造某签名的空顶级组（补丁生成路径）
    pub fn empty(sig: Signature, stamp: u16) -> Self {
        let header = GroupHeader::new(
            HEADER_SIZE,
            GroupLabel::Signature(sig),
            GroupType::Top,
            stamp,
        );
        match &sig {
            b"CELL" => TopGroup::InteriorCells(InteriorCellsGroup::empty(header)),
            b"WRLD" => TopGroup::Worlds(WorldsTopGroup::empty(header)),
            b"DIAL" => TopGroup::Dialogues(DialsTopGroup::empty(header)),
            _ => TopGroup::Records(RecordGroup::empty(
                header.label,
                GroupType::Top,
                stamp,
                vec![sig],
            )),
        }
    }

    /// 顶级组签名
    pub fn signature(&self) -> Signature {
        let header = self.header();
        header.label.as_signature().unwrap_or(*b"????")
    }

    pub fn header(&self) -> &GroupHeader {
        match self {
            TopGroup::Unparsed(g) => &g.header,
            TopGroup::Records(g) => &g.header,
            TopGroup::InteriorCells(g) => &g.header,
            TopGroup::Worlds(g) => &g.header,
            TopGroup::Dialogues(g) => &g.header,
        }
    }

    /// 未解析块视为未变更；任何解析变体都要求重算大小
    pub fn is_dirty(&self) -> bool {
        !matches!(self, TopGroup::Unparsed(_))
    }

    /// 重算（未解析块：返回缓存值）组大小
    pub fn size(&mut self) -> Result<u32, EspError> {
        match self {
            TopGroup::Unparsed(g) => Ok(g.size()),
            TopGroup::Records(g) => g.size(),
            TopGroup::InteriorCells(g) => g.size(),
            TopGroup::Worlds(g) => g.size(),
            TopGroup::Dialogues(g) => g.size(),
        }
    }

    pub fn dump(&self, output: &mut Vec<u8>) -> Result<(), EspError> {
        match self {
            TopGroup::Unparsed(g) => {
                g.dump(output);
                Ok(())
            }
            TopGroup::Records(g) => g.dump(output),
            TopGroup::InteriorCells(g) => g.dump(output),
            TopGroup::Worlds(g) => g.dump(output),
            TopGroup::Dialogues(g) => g.dump(output),
        }
    }

    pub fn record_count(&self, include_groups: bool) -> Result<usize, EspError> {
        Ok(match self {
            TopGroup::Unparsed(g) => g.record_count(include_groups)?,
            TopGroup::Records(g) => g.record_count(include_groups),
            TopGroup::InteriorCells(g) => g.record_count(include_groups),
            TopGroup::Worlds(g) => g.record_count(include_groups),
            TopGroup::Dialogues(g) => g.record_count(include_groups),
        })
    }

    /// 平铺全部已解析记录；未解析块无记录可迭代
    pub fn records(&self) -> Vec<&Record> {
        match self {
            TopGroup::Unparsed(_) => Vec::new(),
            TopGroup::Records(g) => g.records().collect(),
            TopGroup::InteriorCells(g) => g.records(),
            TopGroup::Worlds(g) => g.records(),
            TopGroup::Dialogues(g) => g.records(),
        }
    }

    pub fn update_masters(&self, acc: &mut MasterSet) {
        for record in self.records() {
            record.update_masters(acc);
        }
    }

    /// 合并同签名的源顶级组
    ///
    /// 未解析的目标无法接收合并；加载策略必须先解析该组。
    pub fn merge_records(&mut self, src: &mut TopGroup, st: &mut MergeState) {
        match (self, src) {
            (TopGroup::Records(dest), TopGroup::Records(src)) => dest.merge_records(src, st),
            (TopGroup::InteriorCells(dest), TopGroup::InteriorCells(src)) => {
                dest.merge_records(src, st)
            }
            (TopGroup::Worlds(dest), TopGroup::Worlds(src)) => dest.merge_records(src, st),
            (TopGroup::Dialogues(dest), TopGroup::Dialogues(src)) => dest.merge_records(src, st),
            (dest, _src) => {
                let _sig = sig_to_str(&dest.signature());
                #[cfg(debug_assertions)]
                eprintln!("警告: 顶级组 {} 未解析或变体不匹配，合并跳过", _sig);
            }
        }
    }

    pub fn update_records(&mut self, src: &TopGroup, merge_ids: &mut FidSet) {
        match (self, src) {
            (TopGroup::Records(dest), TopGroup::Records(src)) => {
                dest.update_records(src, merge_ids)
            }
            (TopGroup::InteriorCells(dest), TopGroup::InteriorCells(src)) => {
                dest.update_records(src, merge_ids)
            }
            (TopGroup::Worlds(dest), TopGroup::Worlds(src)) => dest.update_records(src, merge_ids),
            (TopGroup::Dialogues(dest), TopGroup::Dialogues(src)) => {
                dest.update_records(src, merge_ids)
            }
            _ => {}
        }
    }

    pub fn keep_records(&mut self, keep: &mut FidSet) {
        match self {
            TopGroup::Unparsed(_) => {}
            TopGroup::Records(g) => g.keep_records(keep),
            TopGroup::InteriorCells(g) => g.keep_records(keep),
            TopGroup::Worlds(g) => g.keep_records(keep),
            TopGroup::Dialogues(g) => g.keep_records(keep),
        }
    }
}
