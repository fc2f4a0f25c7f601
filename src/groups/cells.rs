use crate::datatypes::FormId;
use crate::groups::cell::CellGroup;
use crate::headers::{unpack_header, GroupHeader, GroupLabel, GroupType, Header, HEADER_SIZE};
use crate::masters::MasterSet;
use crate::merge::{FidSet, MergeState};
use crate::record::{Bsb, Record};
use crate::utils::EspError;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::io::Cursor;

/// 单元格块按 (块, 子块, FormID) 升序排列
///
/// 先按FormID排序再按块稳定排序，同块内保持FormID顺序。
fn sorted_bsb(cells: &IndexMap<FormId, CellGroup>) -> Vec<(Bsb, FormId)> {
    let mut entries: Vec<(Bsb, FormId)> = cells
        .iter()
        .filter_map(|(fid, block)| block.bsb().map(|bsb| (bsb, *fid)))
        .collect();
    entries.sort_by_key(|&(bsb, fid)| (bsb, fid));
    entries
}

/// 单元格块集合的总大小（不含外层组头部）
///
/// 一趟预计算：每个块/子块头部声明的大小必须等于其全部后代
/// 之和加头部自身，先于任何字节写出算好。
pub(crate) fn cell_blocks_size(cells: &mut IndexMap<FormId, CellGroup>) -> Result<u32, EspError> {
    if cells.is_empty() {
        return Ok(0);
    }
    let mut total = 0u32;
    for block in cells.values_mut() {
        total += block.size()?;
    }
    let entries = sorted_bsb(cells);
    let blocks: HashSet<GroupLabel> = entries.iter().map(|(bsb, _)| bsb.block_label()).collect();
    let sub_blocks: HashSet<(GroupLabel, GroupLabel)> = entries
        .iter()
        .map(|(bsb, _)| (bsb.block_label(), bsb.sub_block_label()))
        .collect();
    total += HEADER_SIZE * (blocks.len() + sub_blocks.len()) as u32;
    Ok(total)
}

/// 按块/子块结构序列化单元格块
///
/// 每遇到新的块值写一个块头部，新的(块,子块)对写一个子块头部，
/// 大小全部来自预计算的单元格缓存。
pub(crate) fn dump_cell_blocks(
    output: &mut Vec<u8>,
    cells: &IndexMap<FormId, CellGroup>,
    block_type: GroupType,
    sub_block_type: GroupType,
    stamp: u16,
) -> Result<(), EspError> {
    let entries = sorted_bsb(cells);
    let mut idx = 0;
    while idx < entries.len() {
        let block_label = entries[idx].0.block_label();
        let mut block_end = idx;
        while block_end < entries.len() && entries[block_end].0.block_label() == block_label {
            block_end += 1;
        }

        // 块大小 = 块头部 + 各子块（子块头部 + 单元格块）
        let mut block_size = HEADER_SIZE;
        let mut j = idx;
        while j < block_end {
            let sub_label = entries[j].0.sub_block_label();
            block_size += HEADER_SIZE;
            while j < block_end && entries[j].0.sub_block_label() == sub_label {
                block_size += cells[&entries[j].1].cached_size()?;
                j += 1;
            }
        }
        GroupHeader::new(block_size, block_label, block_type, stamp).pack(output);

        let mut j = idx;
        while j < block_end {
            let sub_label = entries[j].0.sub_block_label();
            let sub_start = j;
            let mut sub_size = HEADER_SIZE;
            while j < block_end && entries[j].0.sub_block_label() == sub_label {
                sub_size += cells[&entries[j].1].cached_size()?;
                j += 1;
            }
            GroupHeader::new(sub_size, sub_label, sub_block_type, stamp).pack(output);
            for (_, fid) in &entries[sub_start..j] {
                cells[fid].dump(output)?;
            }
        }
        idx = block_end;
    }
    Ok(())
}

/// 单元格块集合的记录数（含块/子块头部）
pub(crate) fn cell_blocks_count(
    cells: &IndexMap<FormId, CellGroup>,
    include_groups: bool,
) -> usize {
    let count: usize = cells.values().map(|c| c.record_count(include_groups)).sum();
    if count > 0 && include_groups {
        let entries = sorted_bsb(cells);
        let blocks: HashSet<GroupLabel> =
            entries.iter().map(|(bsb, _)| bsb.block_label()).collect();
        let sub_blocks: HashSet<(GroupLabel, GroupLabel)> = entries
            .iter()
            .map(|(bsb, _)| (bsb.block_label(), bsb.sub_block_label()))
            .collect();
        count + blocks.len() + sub_blocks.len()
    } else {
        count
    }
}

/// 向单元格块映射合并源映射
///
/// 目标缺的块先建空块再委托合并；锚被过滤（或IIM下新建）的
/// 块从目标撤除；源映射破坏性重建为通过过滤的成员。
pub(crate) fn merge_cell_map(
    dest: &mut IndexMap<FormId, CellGroup>,
    src: &mut IndexMap<FormId, CellGroup>,
    stamp: u16,
    st: &mut MergeState,
) {
    let mut filtered = IndexMap::new();
    for (fid, mut src_block) in src.drain(..) {
        let was_newly_added = !dest.contains_key(&fid);
        if was_newly_added {
            dest.insert(fid, CellGroup::new(None, stamp));
        }
        let anchor_gone = match dest.get_mut(&fid) {
            Some(dest_block) => {
                dest_block.merge_records(&mut src_block, st);
                dest_block.cell.is_none()
            }
            None => false,
        };
        if anchor_gone {
            // 锚不在则组不在：IIM下新建的块锚从未被复制，一并撤除
            dest.shift_remove(&fid);
            continue;
        }
        if st.ii_skip_merge {
            continue;
        }
        if st.do_filter && !st.block_passes(&src_block.collect_masters()) {
            if was_newly_added {
                dest.shift_remove(&fid);
            }
            continue;
        }
        filtered.insert(fid, src_block);
    }
    *src = filtered;
}

/// 用源映射更新目标映射中已有的块
pub(crate) fn update_cell_map(
    dest: &mut IndexMap<FormId, CellGroup>,
    src: &IndexMap<FormId, CellGroup>,
    merge_ids: &mut FidSet,
) {
    for (fid, src_block) in src {
        if let Some(dest_block) = dest.get_mut(fid) {
            dest_block.update_records(src_block, merge_ids);
        }
    }
}

/// 自底向上裁剪：先裁每个块的子记录（幸存者会把锚键写进
/// keep集），再按keep集裁块本身
pub(crate) fn keep_cell_map(cells: &mut IndexMap<FormId, CellGroup>, keep: &mut FidSet) {
    for block in cells.values_mut() {
        block.keep_records(keep);
    }
    cells.retain(|fid, _| keep.contains(fid));
}

/// CELL顶级组（室内单元格）
///
/// 室内单元格按FormID尾数分到块/子块；块与子块头部只是
/// 序列化时的再分组产物，解析时仅作边界校验。
#[derive(Debug)]
pub struct InteriorCellsGroup {
    pub header: GroupHeader,
    cells: IndexMap<FormId, CellGroup>,
    /// 无主单元格子组计数（跳过而非致命）
    pub orphans_skipped: u32,
    computed_size: Option<u32>,
}

impl InteriorCellsGroup {
    pub fn empty(header: GroupHeader) -> Self {
        InteriorCellsGroup {
            header,
            cells: IndexMap::new(),
            orphans_skipped: 0,
            computed_size: None,
        }
    }

    /// 解析CELL顶级组内容（头部已读取）
    pub fn parse(header: GroupHeader, cursor: &mut Cursor<&[u8]>) -> Result<Self, EspError> {
        let mut group = InteriorCellsGroup::empty(header);
        let end = cursor.position() + header.blob_size() as u64;
        let mut pending: Option<Record> = None;
        let mut end_block_pos = 0u64;
        let mut end_sub_block_pos = 0u64;

        while cursor.position() < end {
            match unpack_header(cursor)? {
                Header::Record(rec_head) => {
                    if &rec_head.signature != b"CELL" {
                        return Err(EspError::unexpected_record(
                            &rec_head.signature,
                            "CELL Top Block",
                        ));
                    }
                    if let Some(cell) = pending.take() {
                        // 前一个CELL没有子组，直接收尾
                        group.insert_loading(CellGroup::new(Some(cell), header.stamp))?;
                    }
                    let record = Record::parse(rec_head, cursor)?;
                    if cursor.position() > end_block_pos || cursor.position() > end_sub_block_pos {
                        return Err(EspError::Corrupt(format!(
                            "Interior cell <{}> outside of block or subblock",
                            record.group_key()
                        )));
                    }
                    pending = Some(record);
                }
                Header::Group(sub) => match sub.group_type {
                    GroupType::InteriorBlock => {
                        end_block_pos = cursor.position() + sub.blob_size() as u64;
                    }
                    GroupType::InteriorSubBlock => {
                        end_sub_block_pos = cursor.position() + sub.blob_size() as u64;
                    }
                    GroupType::CellChildren => match pending.take() {
                        Some(cell) => {
                            if sub.label.as_fid() != Some(cell.group_key()) {
                                return Err(EspError::MismatchedAnchor {
                                    label: sub.label.as_fid().unwrap_or(FormId(0)),
                                    anchor: cell.group_key(),
                                });
                            }
                            let block = CellGroup::parse(sub, cell, cursor)?;
                            group.insert_loading(block)?;
                        }
                        None => {
                            // 无主子组：计数并跳过
                            group.orphans_skipped += 1;
                            #[cfg(debug_assertions)]
                            eprintln!(
                                "警告: CELL顶级组中发现无主子组 ({:?})，已跳过",
                                sub.label
                            );
                            sub.skip_blob(cursor)?;
                        }
                    },
                    other => {
                        return Err(EspError::UnexpectedSubgroup {
                            group_type: other.to_i32(),
                            context: "CELL Top Block".into(),
                        })
                    }
                },
            }
        }
        if let Some(cell) = pending {
            group.insert_loading(CellGroup::new(Some(cell), header.stamp))?;
        }
        Ok(group)
    }

    fn insert_loading(&mut self, block: CellGroup) -> Result<(), EspError> {
        let Some(fid) = block.cell.as_ref().map(|c| c.group_key()) else {
            return Ok(());
        };
        if self.cells.contains_key(&fid) {
            return Err(EspError::duplicate_record(fid, "CELL Top Block"));
        }
        self.cells.insert(fid, block);
        Ok(())
    }

    fn touch(&mut self) {
        self.computed_size = None;
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn get_cell(&self, fid: FormId) -> Option<&CellGroup> {
        self.cells.get(&fid)
    }

    pub fn get_cell_mut(&mut self, fid: FormId) -> Option<&mut CellGroup> {
        self.touch();
        self.cells.get_mut(&fid)
    }

    /// 添加或覆盖单元格块（程序化路径）
    pub fn set_cell(&mut self, cell: Record) {
        let fid = cell.group_key();
        match self.cells.get_mut(&fid) {
            Some(block) => block.cell = Some(cell),
            None => {
                self.cells
                    .insert(fid, CellGroup::new(Some(cell), self.header.stamp));
            }
        }
        self.touch();
    }

    pub fn size(&mut self) -> Result<u32, EspError> {
        let size = if self.cells.is_empty() {
            0
        } else {
            HEADER_SIZE + cell_blocks_size(&mut self.cells)?
        };
        self.computed_size = Some(size);
        Ok(size)
    }

    pub fn dump(&self, output: &mut Vec<u8>) -> Result<(), EspError> {
        let size = self.computed_size.ok_or(EspError::SizeNotComputed)?;
        if size == 0 {
            return Ok(());
        }
        let mut header = self.header;
        header.size = size;
        header.pack(output);
        dump_cell_blocks(
            output,
            &self.cells,
            GroupType::InteriorBlock,
            GroupType::InteriorSubBlock,
            self.header.stamp,
        )
    }

    pub fn record_count(&self, include_groups: bool) -> usize {
        let count = cell_blocks_count(&self.cells, include_groups);
        if count == 0 {
            0
        } else {
            count + include_groups as usize
        }
    }

    pub fn records(&self) -> Vec<&Record> {
        self.cells.values().flat_map(|c| c.records()).collect()
    }

    pub fn update_masters(&self, acc: &mut MasterSet) {
        for record in self.records() {
            record.update_masters(acc);
        }
    }

    pub fn merge_records(&mut self, src: &mut InteriorCellsGroup, st: &mut MergeState) {
        merge_cell_map(&mut self.cells, &mut src.cells, self.header.stamp, st);
        self.touch();
        src.touch();
    }

    pub fn update_records(&mut self, src: &InteriorCellsGroup, merge_ids: &mut FidSet) {
        update_cell_map(&mut self.cells, &src.cells, merge_ids);
        self.touch();
    }

    pub fn keep_records(&mut self, keep: &mut FidSet) {
        keep_cell_map(&mut self.cells, keep);
        self.touch();
    }
}
