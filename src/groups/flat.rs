use crate::datatypes::{sig_to_str, FormId, Signature};
use crate::headers::{unpack_header, GroupHeader, GroupLabel, GroupType, Header, HEADER_SIZE};
use crate::masters::MasterSet;
use crate::merge::{self, FidSet, MergeState};
use crate::record::Record;
use crate::utils::EspError;
use indexmap::IndexMap;
use std::io::Cursor;

/// 平坦记录组
///
/// 以FormID为键、保持插入顺序的记录集合，只接受构造时声明的
/// 签名集。顶级简单组（GMST、WEAP等）直接使用它。
/// 序列化永远按FormID升序。
#[derive(Debug)]
pub struct RecordGroup {
    pub header: GroupHeader,
    /// 接受的记录签名集（构造时固定，此后不变）
    accepted: Vec<Signature>,
    records: IndexMap<FormId, Record>,
    computed_size: Option<u32>,
}

impl RecordGroup {
    /// 解析组内容（头部已读取）
    pub fn parse(
        header: GroupHeader,
        accepted: Vec<Signature>,
        cursor: &mut Cursor<&[u8]>,
    ) -> Result<Self, EspError> {
        let mut group = RecordGroup {
            header,
            accepted,
            records: IndexMap::new(),
            computed_size: None,
        };
        let end = cursor.position() + header.blob_size() as u64;
        while cursor.position() < end {
            match unpack_header(cursor)? {
                Header::Record(rec_head) => {
                    if !group.accepted.contains(&rec_head.signature) {
                        return Err(EspError::unexpected_record(
                            &rec_head.signature,
                            group.describe(),
                        ));
                    }
                    let record = Record::parse(rec_head, cursor)?;
                    group.insert_loading(record)?;
                }
                Header::Group(sub) => {
                    return Err(EspError::UnexpectedSubgroup {
                        group_type: sub.group_type.to_i32(),
                        context: group.describe(),
                    });
                }
            }
        }
        Ok(group)
    }

    /// 构造空组（程序化建树路径）
    pub fn empty(
        label: GroupLabel,
        group_type: GroupType,
        stamp: u16,
        accepted: Vec<Signature>,
    ) -> Self {
        RecordGroup {
            header: GroupHeader::new(HEADER_SIZE, label, group_type, stamp),
            accepted,
            records: IndexMap::new(),
            computed_size: None,
        }
    }

    fn describe(&self) -> String {
        match self.header.label {
            GroupLabel::Signature(sig) => format!("{} GRUP", sig_to_str(&sig)),
            other => format!("{:?} GRUP", other),
        }
    }

    fn touch(&mut self) {
        self.computed_size = None;
    }

    /// 加载期插入：同键重复是结构错误
    fn insert_loading(&mut self, record: Record) -> Result<(), EspError> {
        let key = record.group_key();
        if self.records.contains_key(&key) {
            return Err(EspError::duplicate_record(key, self.describe()));
        }
        self.records.insert(key, record);
        Ok(())
    }

    /// 获取记录，不存在时不报错
    pub fn get_record(&self, fid: FormId) -> Option<&Record> {
        self.records.get(&fid)
    }

    /// 插入或覆盖记录（程序化路径：同键覆盖不报错）
    pub fn set_record(&mut self, record: Record) {
        self.records.insert(record.group_key(), record);
        self.touch();
    }

    /// 只保留keep集内的记录；无论是否有变化都视为已变更
    pub fn keep_records(&mut self, keep: &FidSet) {
        merge::keep_keyed(&mut self.records, keep);
        self.touch();
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// 按插入顺序迭代记录
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// 重算并缓存组大小；空组为0（整个组省略）
    pub fn size(&mut self) -> Result<u32, EspError> {
        let size = if self.records.is_empty() {
            0
        } else {
            let mut total = HEADER_SIZE;
            for record in self.records.values() {
                total += record.total_size()?;
            }
            total
        };
        self.computed_size = Some(size);
        Ok(size)
    }

    /// 序列化组头部与记录（按FormID升序）
    ///
    /// 必须先调用 size()，否则头部的大小字段无从填写。
    pub fn dump(&self, output: &mut Vec<u8>) -> Result<(), EspError> {
        let size = self.computed_size.ok_or(EspError::SizeNotComputed)?;
        if size == 0 {
            return Ok(());
        }
        let mut header = self.header;
        header.size = size;
        header.pack(output);

        let mut sorted: Vec<&Record> = self.records.values().collect();
        sorted.sort_by_key(|r| r.group_key());
        for record in sorted {
            record.dump(output)?;
        }
        Ok(())
    }

    /// 记录数；include_groups 时把组头部自身计入
    pub fn record_count(&self, include_groups: bool) -> usize {
        let count = self.records.len();
        if count == 0 {
            0
        } else {
            count + include_groups as usize
        }
    }

    pub fn update_masters(&self, acc: &mut MasterSet) {
        for record in self.records.values() {
            record.update_masters(acc);
        }
    }

    /// 从源组合并记录（见 crate::merge::merge_keyed）
    pub fn merge_records(&mut self, src: &mut RecordGroup, st: &mut MergeState) {
        merge::merge_keyed(&mut self.records, &mut src.records, st);
        self.touch();
        src.touch();
    }

    /// 用源组更新双方都有的记录
    pub fn update_records(&mut self, src: &RecordGroup, merge_ids: &mut FidSet) {
        merge::update_keyed(&mut self.records, &src.records, merge_ids);
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn top_header(sig: Signature, blob: u32) -> GroupHeader {
        GroupHeader::new(HEADER_SIZE + blob, GroupLabel::Signature(sig), GroupType::Top, 0)
    }

    fn gmst(fid: u32) -> Record {
        Record::new(*b"GMST", FormId(fid), 0, vec![])
    }

    /// 按插入顺序 {5,1,3} 构造一个GMST顶级组的磁盘字节
    fn build_group_bytes(fids: &[u32]) -> Vec<u8> {
        let mut body = Vec::new();
        for &fid in fids {
            gmst(fid).dump(&mut body).unwrap();
        }
        let mut bytes = Vec::new();
        top_header(*b"GMST", body.len() as u32).pack(&mut bytes);
        bytes.extend_from_slice(&body);
        bytes
    }

    fn parse_group(bytes: &[u8]) -> RecordGroup {
        let mut cursor = Cursor::new(bytes);
        let header = GroupHeader::parse(&mut cursor).unwrap();
        RecordGroup::parse(header, vec![*b"GMST"], &mut cursor).expect("应该能解析组")
    }

    #[test]
    fn test_parse_dump_sorts_by_key() {
        let bytes = build_group_bytes(&[5, 1, 3]);
        let mut group = parse_group(&bytes);

        // 解析保持插入顺序
        let order: Vec<FormId> = group.records().map(|r| r.group_key()).collect();
        assert_eq!(order, vec![FormId(5), FormId(1), FormId(3)]);

        // 3条记录 + 1个组头部
        assert_eq!(group.record_count(true), 4);
        assert_eq!(group.record_count(false), 3);

        // 序列化按键升序
        group.size().unwrap();
        let mut out = Vec::new();
        group.dump(&mut out).unwrap();
        let reparsed = parse_group(&out);
        let order: Vec<FormId> = reparsed.records().map(|r| r.group_key()).collect();
        assert_eq!(order, vec![FormId(1), FormId(3), FormId(5)]);
    }

    #[test]
    fn test_dump_requires_size() {
        let bytes = build_group_bytes(&[1]);
        let group = parse_group(&bytes);
        let mut out = Vec::new();
        assert!(
            matches!(group.dump(&mut out), Err(EspError::SizeNotComputed)),
            "未调用size()的dump是编程错误"
        );
    }

    #[test]
    fn test_size_matches_dump() {
        let bytes = build_group_bytes(&[5, 1, 3]);
        let mut group = parse_group(&bytes);
        let size = group.size().unwrap();
        let mut out = Vec::new();
        group.dump(&mut out).unwrap();
        assert_eq!(out.len() as u32, size, "声明大小必须等于实际字节数");
        // 头部的大小字段同样一致
        assert_eq!(&out[4..8], &size.to_le_bytes());
    }

    #[test]
    fn test_duplicate_record_is_fatal() {
        let bytes = build_group_bytes(&[7, 7]);
        let mut cursor = Cursor::new(&bytes[..]);
        let header = GroupHeader::parse(&mut cursor).unwrap();
        let result = RecordGroup::parse(header, vec![*b"GMST"], &mut cursor);
        assert!(
            matches!(result, Err(EspError::DuplicateRecord { .. })),
            "初次解析遇到重复FormID必须报错"
        );
    }

    #[test]
    fn test_unexpected_signature_is_fatal() {
        let mut body = Vec::new();
        Record::new(*b"WEAP", FormId(1), 0, vec![])
            .dump(&mut body)
            .unwrap();
        let mut bytes = Vec::new();
        top_header(*b"GMST", body.len() as u32).pack(&mut bytes);
        bytes.extend_from_slice(&body);

        let mut cursor = Cursor::new(&bytes[..]);
        let header = GroupHeader::parse(&mut cursor).unwrap();
        let result = RecordGroup::parse(header, vec![*b"GMST"], &mut cursor);
        assert!(matches!(result, Err(EspError::UnexpectedRecord { .. })));
    }

    #[test]
    fn test_set_record_overwrites() {
        let bytes = build_group_bytes(&[7]);
        let mut group = parse_group(&bytes);
        // 程序化插入同键记录是覆盖而非错误
        group.set_record(gmst(7));
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn test_keep_records() {
        let bytes = build_group_bytes(&[1, 2, 3]);
        let mut group = parse_group(&bytes);
        let keep: FidSet = [FormId(2)].into_iter().collect();
        group.keep_records(&keep);
        assert_eq!(group.len(), 1);
        assert!(group.get_record(FormId(2)).is_some());
        assert_eq!(group.record_count(true), 2);
    }

    #[test]
    fn test_empty_group_dumps_nothing() {
        let mut group = RecordGroup::empty(
            GroupLabel::Signature(*b"GMST"),
            GroupType::Top,
            0,
            vec![*b"GMST"],
        );
        assert_eq!(group.size().unwrap(), 0);
        let mut out = Vec::new();
        group.dump(&mut out).unwrap();
        assert!(out.is_empty(), "空组整体省略");
        assert_eq!(group.record_count(true), 0);
    }
}
