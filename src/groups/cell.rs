use crate::datatypes::FormId;
use crate::headers::{unpack_header, GroupHeader, GroupLabel, GroupType, Header, HEADER_SIZE};
use crate::masters::MasterSet;
use crate::merge::{self, AnchorOutcome, FidSet, MergeState};
use crate::record::{Bsb, Record};
use crate::utils::EspError;
use std::io::Cursor;

/// 引用记录签名
const REF_SIGS: [&[u8; 4]; 3] = [b"REFR", b"ACHR", b"ACRE"];

/// 单元格复合组
///
/// 锚CELL记录加其全部子记录：三个引用桶（常驻/临时/远距离，
/// 子组类型8/9/10）、至多一个LAND、至多一个PGRD。
/// 临时桶序列化顺序固定为 LAND → PGRD → 临时引用。
#[derive(Debug)]
pub struct CellGroup {
    pub cell: Option<Record>,
    pub persistent_refs: Vec<Record>,
    pub temp_refs: Vec<Record>,
    pub distant_refs: Vec<Record>,
    pub land: Option<Record>,
    pub pgrd: Option<Record>,
    stamp: u16,
    computed_size: Option<u32>,
}

impl CellGroup {
    pub fn new(cell: Option<Record>, stamp: u16) -> Self {
        CellGroup {
            cell,
            persistent_refs: Vec::new(),
            temp_refs: Vec::new(),
            distant_refs: Vec::new(),
            land: None,
            pgrd: None,
            stamp,
            computed_size: None,
        }
    }

    /// 解析单元格子组（类型6的GRUP，头部已读取）
    pub fn parse(
        children_header: GroupHeader,
        cell: Record,
        cursor: &mut Cursor<&[u8]>,
    ) -> Result<Self, EspError> {
        if let Some(label) = children_header.label.as_fid() {
            if label != cell.group_key() {
                return Err(EspError::MismatchedAnchor {
                    label,
                    anchor: cell.group_key(),
                });
            }
        }

        let mut group = CellGroup::new(Some(cell), children_header.stamp);
        let end = cursor.position() + children_header.blob_size() as u64;
        let mut bucket: Option<GroupType> = None;
        let mut buckets_loaded: Vec<GroupType> = Vec::new();

        while cursor.position() < end {
            match unpack_header(cursor)? {
                Header::Group(sub) => {
                    match sub.group_type {
                        GroupType::CellPersistent
                        | GroupType::CellTemporary
                        | GroupType::CellDistant => {}
                        other => {
                            return Err(EspError::UnexpectedSubgroup {
                                group_type: other.to_i32(),
                                context: "cell children group".into(),
                            })
                        }
                    }
                    if buckets_loaded.contains(&sub.group_type) {
                        return Err(EspError::Corrupt(format!(
                            "Extra subgroup {} in cell children group",
                            sub.group_type.to_i32()
                        )));
                    }
                    buckets_loaded.push(sub.group_type);
                    bucket = Some(sub.group_type);
                }
                Header::Record(rec_head) => {
                    let record = Record::parse(rec_head, cursor)?;
                    if REF_SIGS.contains(&&rec_head.signature) {
                        match bucket {
                            Some(GroupType::CellPersistent) => group.persistent_refs.push(record),
                            Some(GroupType::CellTemporary) => group.temp_refs.push(record),
                            Some(GroupType::CellDistant) => group.distant_refs.push(record),
                            _ => {
                                return Err(EspError::unexpected_record(
                                    &rec_head.signature,
                                    "cell children group (outside reference bucket)",
                                ))
                            }
                        }
                    } else if &rec_head.signature == b"LAND" {
                        group.land = Some(record);
                    } else if &rec_head.signature == b"PGRD" {
                        group.pgrd = Some(record);
                    } else {
                        return Err(EspError::unexpected_record(
                            &rec_head.signature,
                            "cell children group",
                        ));
                    }
                }
            }
        }
        Ok(group)
    }

    fn touch(&mut self) {
        self.computed_size = None;
    }

    /// 锚的块/子块键；锚缺失时无键
    pub fn bsb(&self) -> Option<Bsb> {
        self.cell.as_ref().map(|c| c.bsb())
    }

    /// 锚缺失且无任何子记录
    pub fn is_logically_empty(&self) -> bool {
        self.cell.is_none() && !self.has_children()
    }

    pub(crate) fn has_children(&self) -> bool {
        !self.persistent_refs.is_empty()
            || !self.temp_refs.is_empty()
            || !self.distant_refs.is_empty()
            || self.land.is_some()
            || self.pgrd.is_some()
    }

    /// 临时桶的序列化内容：LAND → PGRD → 临时引用
    fn temp_bucket(&self) -> Vec<&Record> {
        let mut bucket: Vec<&Record> = Vec::new();
        bucket.extend(self.land.iter());
        bucket.extend(self.pgrd.iter());
        bucket.extend(self.temp_refs.iter());
        bucket
    }

    /// 三个桶（含LAND/PGRD并入临时桶）及其子组类型
    fn buckets(&self) -> [(Vec<&Record>, GroupType); 3] {
        [
            (
                self.persistent_refs.iter().collect(),
                GroupType::CellPersistent,
            ),
            (self.temp_bucket(), GroupType::CellTemporary),
            (self.distant_refs.iter().collect(), GroupType::CellDistant),
        ]
    }

    /// 子记录部分的总大小（类型6头部 + 各桶），无子记录时为0
    fn children_size(&self) -> Result<u32, EspError> {
        if !self.has_children() {
            return Ok(0);
        }
        let mut total = HEADER_SIZE;
        for (members, _) in self.buckets() {
            if members.is_empty() {
                continue;
            }
            total += HEADER_SIZE;
            for record in members {
                total += record.total_size()?;
            }
        }
        Ok(total)
    }

    /// 重算并缓存大小（锚 + 子记录组）
    ///
    /// 锚缺失的组逻辑上不存在，大小为0（dump同样什么都不写）。
    pub fn size(&mut self) -> Result<u32, EspError> {
        let total = match &self.cell {
            None => 0,
            Some(cell) => cell.total_size()? + self.children_size()?,
        };
        self.computed_size = Some(total);
        Ok(total)
    }

    /// 已缓存的大小；未调用size()时是编程错误
    pub fn cached_size(&self) -> Result<u32, EspError> {
        self.computed_size.ok_or(EspError::SizeNotComputed)
    }

    /// 序列化：CELL记录，然后（如有子记录）类型6子组与各桶
    ///
    /// 桶内引用按FormID升序。
    pub fn dump(&self, output: &mut Vec<u8>) -> Result<(), EspError> {
        self.cached_size()?;
        let Some(cell) = &self.cell else {
            return Ok(());
        };
        cell.dump(output)?;

        let children_size = self.children_size()?;
        if children_size == 0 {
            return Ok(());
        }
        GroupHeader::new(
            children_size,
            GroupLabel::Fid(cell.group_key()),
            GroupType::CellChildren,
            self.stamp,
        )
        .pack(output);

        for (mut members, group_type) in self.buckets() {
            if members.is_empty() {
                continue;
            }
            let mut bucket_size = HEADER_SIZE;
            for record in &members {
                bucket_size += record.total_size()?;
            }
            GroupHeader::new(
                bucket_size,
                GroupLabel::Fid(cell.group_key()),
                group_type,
                self.stamp,
            )
            .pack(output);
            // LAND/PGRD 固定在临时桶最前，其余按FormID升序
            let lead = members
                .iter()
                .take_while(|r| *r.signature() == *b"LAND" || *r.signature() == *b"PGRD")
                .count();
            members[lead..].sort_by_key(|r| r.group_key());
            for record in members {
                record.dump(output)?;
            }
        }
        Ok(())
    }

    /// 记录数（锚 + 各非空桶及其头部 + 类型6头部）
    pub fn record_count(&self, include_groups: bool) -> usize {
        let mut count = 0;
        for (members, _) in self.buckets() {
            if !members.is_empty() {
                count += members.len() + include_groups as usize;
            }
        }
        if count > 0 {
            count += include_groups as usize;
        }
        count + self.cell.is_some() as usize
    }

    /// 平铺全部记录：锚、常驻、LAND/PGRD/临时、远距离
    pub fn records(&self) -> Vec<&Record> {
        let mut all: Vec<&Record> = Vec::new();
        all.extend(self.cell.iter());
        all.extend(self.persistent_refs.iter());
        all.extend(self.temp_bucket());
        all.extend(self.distant_refs.iter());
        all
    }

    pub fn update_masters(&self, acc: &mut MasterSet) {
        for record in self.records() {
            record.update_masters(acc);
        }
    }

    pub fn collect_masters(&self) -> MasterSet {
        let mut masters = MasterSet::default();
        self.update_masters(&mut masters);
        masters
    }

    /// 裁剪子记录；只要有子记录幸存就把锚键加入keep集。
    /// 锚本身的去留由父级按keep集裁决。
    pub fn keep_records(&mut self, keep: &mut FidSet) {
        merge::keep_slot(&mut self.pgrd, keep);
        merge::keep_slot(&mut self.land, keep);
        merge::keep_ref_list(&mut self.temp_refs, keep);
        merge::keep_ref_list(&mut self.persistent_refs, keep);
        merge::keep_ref_list(&mut self.distant_refs, keep);
        if self.has_children() {
            if let Some(cell) = &self.cell {
                keep.insert(cell.group_key());
            }
        }
        self.touch();
    }

    /// 从源单元格块合并
    ///
    /// 锚被过滤掉时本组锚清空，父级负责撤除整组。
    pub fn merge_records(&mut self, src: &mut CellGroup, st: &mut MergeState) {
        self.touch();
        src.touch();
        if merge::merge_anchor(&mut self.cell, &mut src.cell, st) == AnchorOutcome::FilteredOut {
            return;
        }
        merge::merge_slot(&mut self.pgrd, &mut src.pgrd, st);
        merge::merge_slot(&mut self.land, &mut src.land, st);
        merge::merge_ref_list(&mut self.temp_refs, &mut src.temp_refs, st);
        merge::merge_ref_list(&mut self.persistent_refs, &mut src.persistent_refs, st);
        merge::merge_ref_list(&mut self.distant_refs, &mut src.distant_refs, st);
    }

    /// 用源更新双方都有的记录
    pub fn update_records(&mut self, src: &CellGroup, merge_ids: &mut FidSet) {
        merge::update_slot(&mut self.cell, &src.cell, merge_ids);
        merge::update_slot(&mut self.pgrd, &src.pgrd, merge_ids);
        merge::update_slot(&mut self.land, &src.land, merge_ids);
        merge::update_ref_list(&mut self.persistent_refs, &src.persistent_refs, merge_ids);
        merge::update_ref_list(&mut self.temp_refs, &src.temp_refs, merge_ids);
        merge::update_ref_list(&mut self.distant_refs, &src.distant_refs, merge_ids);
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masters::LoadSet;
    use crate::subrecord::Subrecord;

    fn cell_record(fid: u32) -> Record {
        Record::new(
            *b"CELL",
            FormId(fid),
            0,
            vec![Subrecord::new(*b"DATA", vec![0x01])],
        )
    }

    fn refr(fid: u32) -> Record {
        Record::new(*b"REFR", FormId(fid), 0, vec![])
    }

    fn build_cell_group(cell_fid: u32) -> CellGroup {
        let mut group = CellGroup::new(Some(cell_record(cell_fid)), 0);
        group.persistent_refs.push(refr(0x100));
        group.temp_refs.push(refr(0x201));
        group.temp_refs.push(refr(0x200));
        group.land = Some(Record::new(*b"LAND", FormId(0x300), 0, vec![]));
        group
    }

    #[test]
    fn test_dump_structure_roundtrip() {
        let mut group = build_cell_group(0x10);
        let size = group.size().unwrap();
        let mut out = Vec::new();
        group.dump(&mut out).unwrap();
        assert_eq!(out.len() as u32, size, "声明大小必须等于实际字节数");

        // 重新解析：CELL记录 + 类型6子组
        let mut cursor = Cursor::new(&out[..]);
        let Header::Record(cell_head) = unpack_header(&mut cursor).unwrap() else {
            panic!("第一个应是CELL记录");
        };
        let cell = Record::parse(cell_head, &mut cursor).unwrap();
        let Header::Group(children) = unpack_header(&mut cursor).unwrap() else {
            panic!("CELL后应是子组头部");
        };
        assert_eq!(children.group_type, GroupType::CellChildren);
        let reparsed = CellGroup::parse(children, cell, &mut cursor).unwrap();

        assert_eq!(reparsed.persistent_refs.len(), 1);
        assert_eq!(reparsed.temp_refs.len(), 2);
        assert!(reparsed.land.is_some());
        // 临时桶按FormID排序后回写
        let temp_order: Vec<FormId> = reparsed.temp_refs.iter().map(|r| r.group_key()).collect();
        assert_eq!(temp_order, vec![FormId(0x200), FormId(0x201)]);
    }

    #[test]
    fn test_mismatched_anchor_label() {
        let mut body = Vec::new();
        refr(1).dump(&mut body).unwrap();
        let header = GroupHeader::new(
            HEADER_SIZE + body.len() as u32,
            GroupLabel::Fid(FormId(0x99)),
            GroupType::CellChildren,
            0,
        );
        let mut cursor = Cursor::new(&body[..]);
        let result = CellGroup::parse(header, cell_record(0x10), &mut cursor);
        assert!(
            matches!(result, Err(EspError::MismatchedAnchor { .. })),
            "子组标签与锚不一致必须报错"
        );
    }

    #[test]
    fn test_keep_restores_anchor_for_surviving_children() {
        let mut group = build_cell_group(0x10);
        let mut keep: FidSet = [FormId(0x100)].into_iter().collect();
        group.keep_records(&mut keep);

        assert!(keep.contains(&FormId(0x10)), "有子记录幸存时锚键必须加入keep集");
        assert!(group.land.is_none());
        assert_eq!(group.temp_refs.len(), 0);
        assert_eq!(group.persistent_refs.len(), 1);
    }

    #[test]
    fn test_keep_empty_cell_not_kept() {
        let mut group = build_cell_group(0x10);
        let mut keep: FidSet = FidSet::new();
        group.keep_records(&mut keep);
        assert!(
            !keep.contains(&FormId(0x10)),
            "无子记录幸存且keep集未点名时锚不保留"
        );
        assert!(!group.has_children());
    }

    #[test]
    fn test_merge_replaces_and_appends_refs() {
        let mut dest = build_cell_group(0x10);
        let mut src = CellGroup::new(Some(cell_record(0x10)), 0);
        src.persistent_refs.push(refr(0x100)); // 已有：原位替换
        src.persistent_refs.push(refr(0x101)); // 新增：追加

        let load_set = LoadSet::first(1);
        let mut merge_ids = FidSet::new();
        let mut st = MergeState {
            load_set: &load_set,
            merge_ids: &mut merge_ids,
            ii_skip_merge: false,
            do_filter: false,
        };
        dest.merge_records(&mut src, &mut st);

        assert_eq!(dest.persistent_refs.len(), 2);
        assert!(merge_ids.contains(&FormId(0x10)), "锚也计入merged-id");
        assert!(merge_ids.contains(&FormId(0x101)));
    }
}
