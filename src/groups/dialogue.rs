use crate::datatypes::FormId;
use crate::headers::{unpack_header, GroupHeader, GroupLabel, GroupType, Header, HEADER_SIZE};
use crate::masters::MasterSet;
use crate::merge::{self, AnchorOutcome, FidSet, MergeState};
use crate::record::Record;
use crate::utils::EspError;
use indexmap::IndexMap;
use std::collections::{HashSet, VecDeque};
use std::io::Cursor;

/// 对话复合组
///
/// 锚DIAL记录加一个类型7子组的INFO响应序列。响应不是线性表，
/// 而是靠PNAM前驱引用构成的有向图，序列化顺序见 `sort_infos`。
#[derive(Debug)]
pub struct DialGroup {
    pub dial: Option<Record>,
    infos: IndexMap<FormId, Record>,
    stamp: u16,
    computed_size: Option<u32>,
}

impl DialGroup {
    pub fn new(dial: Option<Record>, stamp: u16) -> Self {
        DialGroup {
            dial,
            infos: IndexMap::new(),
            stamp,
            computed_size: None,
        }
    }

    /// 解析对话子组（类型7的GRUP，头部已读取）
    pub fn parse(
        children_header: GroupHeader,
        dial: Record,
        cursor: &mut Cursor<&[u8]>,
    ) -> Result<Self, EspError> {
        if let Some(label) = children_header.label.as_fid() {
            if label != dial.group_key() {
                return Err(EspError::MismatchedAnchor {
                    label,
                    anchor: dial.group_key(),
                });
            }
        }

        let mut group = DialGroup::new(Some(dial), children_header.stamp);
        let end = cursor.position() + children_header.blob_size() as u64;
        while cursor.position() < end {
            match unpack_header(cursor)? {
                Header::Record(rec_head) => {
                    if &rec_head.signature != b"INFO" {
                        return Err(EspError::unexpected_record(
                            &rec_head.signature,
                            "DIAL children group",
                        ));
                    }
                    let record = Record::parse(rec_head, cursor)?;
                    let key = record.group_key();
                    if group.infos.contains_key(&key) {
                        return Err(EspError::duplicate_record(key, "DIAL children group"));
                    }
                    group.infos.insert(key, record);
                }
                Header::Group(sub) => {
                    return Err(EspError::UnexpectedSubgroup {
                        group_type: sub.group_type.to_i32(),
                        context: "DIAL children group".into(),
                    })
                }
            }
        }
        Ok(group)
    }

    fn touch(&mut self) {
        self.computed_size = None;
    }

    pub fn group_key(&self) -> Option<FormId> {
        self.dial.as_ref().map(|d| d.group_key())
    }

    pub fn info_count(&self) -> usize {
        self.infos.len()
    }

    pub fn get_info(&self, fid: FormId) -> Option<&Record> {
        self.infos.get(&fid)
    }

    /// 插入或覆盖响应（程序化路径）
    pub fn set_info(&mut self, record: Record) {
        self.infos.insert(record.group_key(), record);
        self.touch();
    }

    pub(crate) fn set_stamp(&mut self, stamp: u16) {
        self.stamp = stamp;
    }

    /// 重算并缓存大小；锚缺失的组逻辑上不存在，大小为0
    pub fn size(&mut self) -> Result<u32, EspError> {
        let total = match &self.dial {
            None => 0,
            Some(dial) => {
                let mut total = dial.total_size()?;
                if !self.infos.is_empty() {
                    total += HEADER_SIZE;
                    for info in self.infos.values() {
                        total += info.total_size()?;
                    }
                }
                total
            }
        };
        self.computed_size = Some(total);
        Ok(total)
    }

    pub fn cached_size(&self) -> Result<u32, EspError> {
        self.computed_size.ok_or(EspError::SizeNotComputed)
    }

    /// 序列化：DIAL记录，然后（如有响应）类型7子组按依赖序
    pub fn dump(&self, output: &mut Vec<u8>) -> Result<(), EspError> {
        self.cached_size()?;
        let Some(dial) = &self.dial else {
            return Ok(());
        };
        dial.dump(output)?;
        if self.infos.is_empty() {
            return Ok(());
        }

        let mut children_size = HEADER_SIZE;
        for info in self.infos.values() {
            children_size += info.total_size()?;
        }
        GroupHeader::new(
            children_size,
            GroupLabel::Fid(dial.group_key()),
            GroupType::TopicChildren,
            self.stamp,
        )
        .pack(output);

        for info in sort_infos(&self.infos) {
            info.dump(output)?;
        }
        Ok(())
    }

    pub fn record_count(&self, include_groups: bool) -> usize {
        let mut count = self.dial.is_some() as usize;
        if !self.infos.is_empty() {
            count += self.infos.len() + include_groups as usize;
        }
        count
    }

    pub fn records(&self) -> Vec<&Record> {
        let mut all: Vec<&Record> = Vec::new();
        all.extend(self.dial.iter());
        all.extend(self.infos.values());
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

    /// 从源对话块合并：先锚后响应
    ///
    /// 锚被过滤掉（或源锚被忽略）时不碰响应；锚清空后
    /// 父级负责撤除整组。
    pub fn merge_records(&mut self, src: &mut DialGroup, st: &mut MergeState) {
        self.touch();
        src.touch();
        match merge::merge_anchor(&mut self.dial, &mut src.dial, st) {
            AnchorOutcome::Merge => {
                merge::merge_keyed(&mut self.infos, &mut src.infos, st);
            }
            AnchorOutcome::FilteredOut | AnchorOutcome::Skip => {}
        }
    }

    /// 用源更新锚与双方都有的响应
    pub fn update_records(&mut self, src: &DialGroup, merge_ids: &mut FidSet) {
        merge::update_slot(&mut self.dial, &src.dial, merge_ids);
        merge::update_keyed(&mut self.infos, &src.infos, merge_ids);
        self.touch();
    }

    /// 两段式裁剪：先裁响应，锚暂时移除，keep集点名或仍有
    /// 响应幸存时恢复（并把锚键补进keep集）
    pub fn keep_records(&mut self, keep: &mut FidSet) {
        merge::keep_keyed(&mut self.infos, keep);
        if let Some(dial) = self.dial.take() {
            if !self.infos.is_empty() || keep.contains(&dial.group_key()) {
                keep.insert(dial.group_key());
                self.dial = Some(dial);
            }
        }
        self.touch();
    }
}

/// 按PNAM前驱依赖排序响应
///
/// 无前驱的响应按输入顺序打底，其余响应插到各自前驱的紧后面；
/// 前驱在已排序列表里找不到的（指向文件外，或成环）在一整轮
/// 无进展后追加到末尾。不做环检测：区分合法的外部引用与
/// 作者错误的环代价过高，追加是既定的尽力而为策略。
fn sort_infos(infos: &IndexMap<FormId, Record>) -> Vec<&Record> {
    let mut sorted: Vec<&Record> = Vec::new();
    let mut remaining: VecDeque<&Record> = VecDeque::new();
    for record in infos.values() {
        if record.prev_info().is_none() {
            sorted.push(record);
        } else {
            remaining.push_back(record);
        }
    }

    let mut visited: HashSet<FormId> = HashSet::new();
    while let Some(current) = remaining.pop_back() {
        let wanted_prev = current.prev_info();
        if let Some(i) = sorted
            .iter()
            .position(|candidate| Some(candidate.group_key()) == wanted_prev)
        {
            sorted.insert(i + 1, current);
        } else if visited.contains(&current.group_key()) {
            sorted.push(current);
        } else {
            visited.insert(current.group_key());
            remaining.push_front(current);
        }
    }
    sorted
}

/// DIAL顶级组
#[derive(Debug)]
pub struct DialsTopGroup {
    pub header: GroupHeader,
    dials: IndexMap<FormId, DialGroup>,
    pub orphans_skipped: u32,
    computed_size: Option<u32>,
}

impl DialsTopGroup {
    pub fn empty(header: GroupHeader) -> Self {
        DialsTopGroup {
            header,
            dials: IndexMap::new(),
            orphans_skipped: 0,
            computed_size: None,
        }
    }

    /// 解析DIAL顶级组内容（头部已读取）
    pub fn parse(header: GroupHeader, cursor: &mut Cursor<&[u8]>) -> Result<Self, EspError> {
        let mut group = DialsTopGroup::empty(header);
        let end = cursor.position() + header.blob_size() as u64;
        let mut pending: Option<Record> = None;

        while cursor.position() < end {
            match unpack_header(cursor)? {
                Header::Record(rec_head) => {
                    if &rec_head.signature != b"DIAL" {
                        return Err(EspError::unexpected_record(
                            &rec_head.signature,
                            "DIAL Top Block",
                        ));
                    }
                    if let Some(dial) = pending.take() {
                        group.insert_loading(DialGroup::new(Some(dial), header.stamp))?;
                    }
                    pending = Some(Record::parse(rec_head, cursor)?);
                }
                Header::Group(sub) => {
                    if sub.group_type != GroupType::TopicChildren {
                        return Err(EspError::UnexpectedSubgroup {
                            group_type: sub.group_type.to_i32(),
                            context: "DIAL group".into(),
                        });
                    }
                    let label = sub.label.as_fid().unwrap_or(FormId(0));
                    let anchor = match pending.take() {
                        Some(dial) if dial.group_key() == label => Some(dial),
                        other => {
                            if let Some(dial) = other {
                                group.insert_loading(DialGroup::new(
                                    Some(dial),
                                    header.stamp,
                                ))?;
                            }
                            if group
                                .dials
                                .get(&label)
                                .is_some_and(|d| d.infos.is_empty())
                            {
                                group.dials.shift_remove(&label).and_then(|d| d.dial)
                            } else if group.dials.contains_key(&label) {
                                return Err(EspError::duplicate_record(label, "DIAL Top Block"));
                            } else {
                                None
                            }
                        }
                    };
                    match anchor {
                        Some(dial) => {
                            let block = DialGroup::parse(sub, dial, cursor)?;
                            group.insert_loading(block)?;
                        }
                        None => {
                            group.orphans_skipped += 1;
                            #[cfg(debug_assertions)]
                            eprintln!("警告: DIAL顶级组中发现无主子组 ({})，已跳过", label);
                            sub.skip_blob(cursor)?;
                        }
                    }
                }
            }
        }
        if let Some(dial) = pending {
            group.insert_loading(DialGroup::new(Some(dial), header.stamp))?;
        }
        Ok(group)
    }

    fn insert_loading(&mut self, block: DialGroup) -> Result<(), EspError> {
        let Some(fid) = block.group_key() else {
            return Ok(());
        };
        if self.dials.contains_key(&fid) {
            return Err(EspError::duplicate_record(fid, "DIAL Top Block"));
        }
        self.dials.insert(fid, block);
        Ok(())
    }

    fn touch(&mut self) {
        self.computed_size = None;
    }

    pub fn is_empty(&self) -> bool {
        self.dials.is_empty()
    }

    pub fn len(&self) -> usize {
        self.dials.len()
    }

    pub fn get_dial(&self, fid: FormId) -> Option<&DialGroup> {
        self.dials.get(&fid)
    }

    /// 添加或覆盖对话块（程序化路径）
    pub fn set_dial(&mut self, dial: Record) -> &mut DialGroup {
        self.computed_size = None;
        let fid = dial.group_key();
        match self.dials.entry(fid) {
            indexmap::map::Entry::Occupied(entry) => {
                let block = entry.into_mut();
                block.dial = Some(dial);
                block
            }
            indexmap::map::Entry::Vacant(entry) => {
                entry.insert(DialGroup::new(Some(dial), self.header.stamp))
            }
        }
    }

    /// 重算并缓存大小；子组头部的时间戳统一成顶级组的
    pub fn size(&mut self) -> Result<u32, EspError> {
        let stamp = self.header.stamp;
        let size = if self.dials.is_empty() {
            0
        } else {
            let mut total = HEADER_SIZE;
            for block in self.dials.values_mut() {
                block.set_stamp(stamp);
                total += block.size()?;
            }
            total
        };
        self.computed_size = Some(size);
        Ok(size)
    }

    /// 序列化：对话块按DIAL FormID升序
    pub fn dump(&self, output: &mut Vec<u8>) -> Result<(), EspError> {
        let size = self.computed_size.ok_or(EspError::SizeNotComputed)?;
        if size == 0 {
            return Ok(());
        }
        let mut header = self.header;
        header.size = size;
        header.pack(output);

        let mut sorted: Vec<&DialGroup> = self.dials.values().collect();
        sorted.sort_by_key(|d| d.group_key());
        for block in sorted {
            block.dump(output)?;
        }
        Ok(())
    }

    pub fn record_count(&self, include_groups: bool) -> usize {
        let count: usize = self
            .dials
            .values()
            .map(|d| d.record_count(include_groups))
            .sum();
        if count == 0 {
            0
        } else {
            count + include_groups as usize
        }
    }

    pub fn records(&self) -> Vec<&Record> {
        self.dials.values().flat_map(|d| d.records()).collect()
    }

    pub fn update_masters(&self, acc: &mut MasterSet) {
        for record in self.records() {
            record.update_masters(acc);
        }
    }

    pub fn merge_records(&mut self, src: &mut DialsTopGroup, st: &mut MergeState) {
        let stamp = self.header.stamp;
        let mut filtered = IndexMap::new();
        for (fid, mut src_block) in src.dials.drain(..) {
            let was_newly_added = !self.dials.contains_key(&fid);
            if was_newly_added {
                self.dials.insert(fid, DialGroup::new(None, stamp));
            }
            let anchor_gone = match self.dials.get_mut(&fid) {
                Some(dest_block) => {
                    dest_block.merge_records(&mut src_block, st);
                    dest_block.dial.is_none()
                }
                None => false,
            };
            if anchor_gone {
                // 锚不在则组不在：IIM下新建的块锚从未被复制，一并撤除
                self.dials.shift_remove(&fid);
                continue;
            }
            if st.ii_skip_merge {
                continue;
            }
            if st.do_filter && !st.block_passes(&src_block.collect_masters()) {
                if was_newly_added {
                    self.dials.shift_remove(&fid);
                }
                continue;
            }
            filtered.insert(fid, src_block);
        }
        src.dials = filtered;
        self.touch();
        src.touch();
    }

    pub fn update_records(&mut self, src: &DialsTopGroup, merge_ids: &mut FidSet) {
        for (fid, src_block) in &src.dials {
            if let Some(dest_block) = self.dials.get_mut(fid) {
                dest_block.update_records(src_block, merge_ids);
            }
        }
        self.touch();
    }

    /// 裁剪各对话块；锚未能恢复的块从映射撤除
    pub fn keep_records(&mut self, keep: &mut FidSet) {
        for block in self.dials.values_mut() {
            block.keep_records(keep);
        }
        self.dials.retain(|_, block| block.dial.is_some());
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masters::LoadSet;
    use crate::subrecord::Subrecord;

    fn dial(fid: u32) -> Record {
        Record::new(*b"DIAL", FormId(fid), 0, vec![])
    }

    fn info(fid: u32, prev: Option<u32>) -> Record {
        let subrecords = match prev {
            Some(p) => vec![Subrecord::new(*b"PNAM", p.to_le_bytes().to_vec())],
            None => vec![],
        };
        Record::new(*b"INFO", FormId(fid), 0, subrecords)
    }

    fn sorted_fids(infos: &IndexMap<FormId, Record>) -> Vec<FormId> {
        sort_infos(infos).iter().map(|r| r.group_key()).collect()
    }

    #[test]
    fn test_sort_infos_dependency_order() {
        // 输入顺序 [C(prev=B), B(prev=A), A, D]，期望 [A, B, C, D]
        let (a, b, c, d) = (1u32, 2u32, 3u32, 4u32);
        let mut infos = IndexMap::new();
        for record in [info(c, Some(b)), info(b, Some(a)), info(a, None), info(d, None)] {
            infos.insert(record.group_key(), record);
        }
        assert_eq!(
            sorted_fids(&infos),
            vec![FormId(a), FormId(b), FormId(c), FormId(d)]
        );
    }

    #[test]
    fn test_sort_infos_dangling_prev_appended() {
        let mut infos = IndexMap::new();
        for record in [info(1, Some(0x99)), info(2, None)] {
            infos.insert(record.group_key(), record);
        }
        // 前驱指向文件外：追加到末尾，不报错
        assert_eq!(sorted_fids(&infos), vec![FormId(2), FormId(1)]);
    }

    #[test]
    fn test_sort_infos_cycle_terminates() {
        let mut infos = IndexMap::new();
        for record in [info(1, Some(2)), info(2, Some(1))] {
            infos.insert(record.group_key(), record);
        }
        let order = sorted_fids(&infos);
        assert_eq!(order.len(), 2, "环必须终止而不是死循环");
    }

    #[test]
    fn test_dial_dump_reparse() {
        let mut top = DialsTopGroup::empty(GroupHeader::new(
            HEADER_SIZE,
            GroupLabel::Signature(*b"DIAL"),
            GroupType::Top,
            9,
        ));
        let block = top.set_dial(dial(0x10));
        block.set_info(info(0x21, None));
        block.set_info(info(0x22, Some(0x21)));

        let size = top.size().unwrap();
        let mut out = Vec::new();
        top.dump(&mut out).unwrap();
        assert_eq!(out.len() as u32, size);

        let mut cursor = Cursor::new(&out[..]);
        let header = GroupHeader::parse(&mut cursor).unwrap();
        let reparsed = DialsTopGroup::parse(header, &mut cursor).unwrap();
        assert_eq!(reparsed.len(), 1);
        let dial_block = reparsed.get_dial(FormId(0x10)).unwrap();
        assert_eq!(dial_block.info_count(), 2);
        // 子组头部的时间戳来自顶级组
        assert_eq!(dial_block.stamp, 9);
    }

    #[test]
    fn test_keep_two_phase_anchor_restore() {
        let mut top = DialsTopGroup::empty(GroupHeader::new(
            HEADER_SIZE,
            GroupLabel::Signature(*b"DIAL"),
            GroupType::Top,
            0,
        ));
        let block = top.set_dial(dial(0x10));
        block.set_info(info(0x21, None));
        let block = top.set_dial(dial(0x11));
        block.set_info(info(0x31, None));

        // 只点名0x21：0x10靠幸存响应恢复，0x11整块消失
        let mut keep: FidSet = [FormId(0x21)].into_iter().collect();
        top.keep_records(&mut keep);
        assert_eq!(top.len(), 1);
        assert!(keep.contains(&FormId(0x10)), "锚靠幸存子记录恢复并进入keep集");
        assert!(!keep.contains(&FormId(0x11)));
    }

    #[test]
    fn test_merge_filtered_anchor_retracts_block() {
        let mut dest = DialsTopGroup::empty(GroupHeader::new(
            HEADER_SIZE,
            GroupLabel::Signature(*b"DIAL"),
            GroupType::Top,
            0,
        ));
        let block = dest.set_dial(dial(0x10));
        block.set_info(info(0x21, None));

        let mut src = DialsTopGroup::empty(dest.header);
        // 源锚引用了未加载的主文件2
        let src_block = src.set_dial(Record::new(
            *b"DIAL",
            FormId(0x10),
            0,
            vec![Subrecord::new(
                *b"QSTI",
                0x0200_0001u32.to_le_bytes().to_vec(),
            )],
        ));
        src_block.set_info(info(0x22, None));

        let load_set = LoadSet::first(1);
        let mut merge_ids = FidSet::new();
        let mut st = MergeState {
            load_set: &load_set,
            merge_ids: &mut merge_ids,
            ii_skip_merge: false,
            do_filter: true,
        };
        dest.merge_records(&mut src, &mut st);

        assert!(
            dest.is_empty(),
            "源锚被过滤时目标复合组必须从父级映射撤除"
        );
        assert!(merge_ids.is_empty());
    }
}
