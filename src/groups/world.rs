use crate::datatypes::FormId;
use crate::groups::cell::CellGroup;
use crate::groups::cells::{
    cell_blocks_count, cell_blocks_size, dump_cell_blocks, keep_cell_map, merge_cell_map,
    update_cell_map,
};
use crate::headers::{unpack_header, GroupHeader, GroupLabel, GroupType, Header, HEADER_SIZE};
use crate::masters::MasterSet;
use crate::merge::{self, AnchorOutcome, FidSet, MergeState};
use crate::record::Record;
use crate::utils::EspError;
use indexmap::IndexMap;
use std::io::Cursor;

/// 世界复合组
///
/// 锚WRLD记录加其子组（类型1）：至多一条ROAD、至多一个承载
/// 全部常驻引用的单元格块、若干普通室外单元格块。
/// 序列化顺序固定：ROAD → 常驻单元格块 → 按块/子块分组的单元格。
#[derive(Debug)]
pub struct WorldGroup {
    pub world: Option<Record>,
    pub road: Option<Record>,
    pub persistent_cell: Option<CellGroup>,
    cells: IndexMap<FormId, CellGroup>,
    /// 无主单元格子组计数（跳过而非致命）
    pub orphans_skipped: u32,
    stamp: u16,
    computed_size: Option<u32>,
}

impl WorldGroup {
    pub fn new(world: Option<Record>, stamp: u16) -> Self {
        WorldGroup {
            world,
            road: None,
            persistent_cell: None,
            cells: IndexMap::new(),
            orphans_skipped: 0,
            stamp,
            computed_size: None,
        }
    }

    /// 解析世界子组（类型1的GRUP，头部已读取）
    pub fn parse(
        children_header: GroupHeader,
        world: Record,
        cursor: &mut Cursor<&[u8]>,
    ) -> Result<Self, EspError> {
        if let Some(label) = children_header.label.as_fid() {
            if label != world.group_key() {
                return Err(EspError::MismatchedAnchor {
                    label,
                    anchor: world.group_key(),
                });
            }
        }

        let world_fid = world.group_key();
        let mut group = WorldGroup::new(Some(world), children_header.stamp);
        let end = cursor.position() + children_header.blob_size() as u64;
        let mut pending: Option<Record> = None;

        while cursor.position() < end {
            match unpack_header(cursor)? {
                Header::Record(rec_head) => match &rec_head.signature {
                    b"ROAD" => {
                        group.road = Some(Record::parse(rec_head, cursor)?);
                    }
                    b"CELL" => {
                        if let Some(cell) = pending.take() {
                            group.insert_loading(CellGroup::new(Some(cell), group.stamp))?;
                        }
                        pending = Some(Record::parse(rec_head, cursor)?);
                    }
                    other => {
                        return Err(EspError::unexpected_record(other, "World Block"));
                    }
                },
                Header::Group(sub) => match sub.group_type {
                    // 块/子块只是再分组标记，内容顺着读
                    GroupType::ExteriorBlock | GroupType::ExteriorSubBlock => {}
                    GroupType::CellChildren => {
                        let label = sub.label.as_fid().unwrap_or(FormId(0));
                        let anchor = match pending.take() {
                            Some(cell) if cell.group_key() == label => Some(cell),
                            other => {
                                if let Some(cell) = other {
                                    // 前一个CELL没有子组，先收尾
                                    group.insert_loading(CellGroup::new(
                                        Some(cell),
                                        group.stamp,
                                    ))?;
                                }
                                // 此前收尾的无子组单元格，子组后到：取回补挂
                                if group.cells.get(&label).is_some_and(|b| !b.has_children()) {
                                    group.cells.shift_remove(&label).and_then(|b| b.cell)
                                } else if group.cells.contains_key(&label) {
                                    return Err(EspError::duplicate_record(
                                        label,
                                        format!("WRLD {} children", world_fid),
                                    ));
                                } else {
                                    None
                                }
                            }
                        };
                        match anchor {
                            Some(cell) => {
                                let block = CellGroup::parse(sub, cell, cursor)?;
                                group.insert_loading(block)?;
                            }
                            None => {
                                // 无主单元格子组：计数并跳过
                                group.orphans_skipped += 1;
                                #[cfg(debug_assertions)]
                                eprintln!(
                                    "警告: WRLD {} 中发现无主单元格子组 ({})，已跳过",
                                    world_fid, label
                                );
                                sub.skip_blob(cursor)?;
                            }
                        }
                    }
                    other => {
                        return Err(EspError::UnexpectedSubgroup {
                            group_type: other.to_i32(),
                            context: "world children group".into(),
                        })
                    }
                },
            }
        }
        if let Some(cell) = pending {
            group.insert_loading(CellGroup::new(Some(cell), group.stamp))?;
        }
        Ok(group)
    }

    /// 加载期登记单元格块：常驻标志的CELL进常驻槽，其余按键登记
    fn insert_loading(&mut self, block: CellGroup) -> Result<(), EspError> {
        let Some(cell) = block.cell.as_ref() else {
            return Ok(());
        };
        if cell.is_persistent() {
            if self.persistent_cell.is_some() {
                return Err(EspError::Corrupt(format!(
                    "Misplaced exterior cell {} (second persistent cell)",
                    cell.group_key()
                )));
            }
            self.persistent_cell = Some(block);
            return Ok(());
        }
        let fid = cell.group_key();
        if self.cells.contains_key(&fid) {
            return Err(EspError::duplicate_record(fid, "World Block"));
        }
        self.cells.insert(fid, block);
        Ok(())
    }

    fn touch(&mut self) {
        self.computed_size = None;
    }

    pub fn group_key(&self) -> Option<FormId> {
        self.world.as_ref().map(|w| w.group_key())
    }

    pub fn cells(&self) -> &IndexMap<FormId, CellGroup> {
        &self.cells
    }

    pub fn get_cell_mut(&mut self, fid: FormId) -> Option<&mut CellGroup> {
        self.touch();
        self.cells.get_mut(&fid)
    }

    /// 添加或覆盖普通单元格块（程序化路径）
    pub fn set_cell(&mut self, cell: Record) {
        let fid = cell.group_key();
        match self.cells.get_mut(&fid) {
            Some(block) => block.cell = Some(cell),
            None => {
                self.cells.insert(fid, CellGroup::new(Some(cell), self.stamp));
            }
        }
        self.touch();
    }

    /// 设置承载常驻引用的单元格块
    pub fn set_persistent_cell(&mut self, cell: Record) {
        match self.persistent_cell.as_mut() {
            Some(block) => block.cell = Some(cell),
            None => self.persistent_cell = Some(CellGroup::new(Some(cell), self.stamp)),
        }
        self.touch();
    }

    fn has_children(&self) -> bool {
        self.road.is_some()
            || self
                .persistent_cell
                .as_ref()
                .is_some_and(|p| !p.is_logically_empty())
            || !self.cells.is_empty()
    }

    /// 世界子组部分的大小（类型1头部 + ROAD + 常驻块 + 单元格块）
    fn children_size(&mut self) -> Result<u32, EspError> {
        if !self.has_children() {
            return Ok(0);
        }
        let mut total = HEADER_SIZE;
        if let Some(road) = &self.road {
            total += road.total_size()?;
        }
        if let Some(persistent) = self.persistent_cell.as_mut() {
            total += persistent.size()?;
        }
        total += cell_blocks_size(&mut self.cells)?;
        Ok(total)
    }

    /// 重算并缓存大小；锚缺失的组逻辑上不存在，大小为0
    pub fn size(&mut self) -> Result<u32, EspError> {
        let total = if self.world.is_some() {
            let mut total = 0;
            if let Some(world) = &self.world {
                total += world.total_size()?;
            }
            total + self.children_size()?
        } else {
            0
        };
        self.computed_size = Some(total);
        Ok(total)
    }

    pub fn cached_size(&self) -> Result<u32, EspError> {
        self.computed_size.ok_or(EspError::SizeNotComputed)
    }

    /// 序列化：WRLD记录，然后（如有内容）类型1子组
    pub fn dump(&self, output: &mut Vec<u8>) -> Result<(), EspError> {
        self.cached_size()?;
        let Some(world) = &self.world else {
            return Ok(());
        };
        world.dump(output)?;
        if !self.has_children() {
            return Ok(());
        }

        let mut children_size = HEADER_SIZE;
        if let Some(road) = &self.road {
            children_size += road.total_size()?;
        }
        if let Some(persistent) = &self.persistent_cell {
            children_size += persistent.cached_size()?;
        }
        {
            // 单元格块大小来自缓存，逐块累加
            for block in self.cells.values() {
                children_size += block.cached_size()?;
            }
            let entries: std::collections::HashSet<(GroupLabel, GroupLabel)> = self
                .cells
                .values()
                .filter_map(|c| c.bsb())
                .map(|b| (b.block_label(), b.sub_block_label()))
                .collect();
            let blocks: std::collections::HashSet<GroupLabel> =
                entries.iter().map(|(b, _)| *b).collect();
            children_size += HEADER_SIZE * (blocks.len() + entries.len()) as u32;
        }

        GroupHeader::new(
            children_size,
            GroupLabel::Fid(world.group_key()),
            GroupType::WorldChildren,
            self.stamp,
        )
        .pack(output);

        // 顺序：ROAD → 常驻单元格块 → 普通单元格块
        if let Some(road) = &self.road {
            road.dump(output)?;
        }
        if let Some(persistent) = &self.persistent_cell {
            persistent.dump(output)?;
        }
        dump_cell_blocks(
            output,
            &self.cells,
            GroupType::ExteriorBlock,
            GroupType::ExteriorSubBlock,
            self.stamp,
        )
    }

    pub fn record_count(&self, include_groups: bool) -> usize {
        let mut count = self.world.is_some() as usize;
        count += self.road.is_some() as usize;
        if let Some(persistent) = &self.persistent_cell {
            count += persistent.record_count(include_groups);
        }
        count += cell_blocks_count(&self.cells, include_groups);
        if include_groups && self.has_children() {
            count += 1;
        }
        count
    }

    pub fn records(&self) -> Vec<&Record> {
        let mut all: Vec<&Record> = Vec::new();
        all.extend(self.world.iter());
        all.extend(self.road.iter());
        if let Some(persistent) = &self.persistent_cell {
            all.extend(persistent.records());
        }
        for block in self.cells.values() {
            all.extend(block.records());
        }
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

    pub fn merge_records(&mut self, src: &mut WorldGroup, st: &mut MergeState) {
        self.touch();
        src.touch();
        if merge::merge_anchor(&mut self.world, &mut src.world, st) == AnchorOutcome::FilteredOut {
            return;
        }
        merge::merge_slot(&mut self.road, &mut src.road, st);

        if let Some(src_persistent) = src.persistent_cell.as_mut() {
            let was_newly_added = self.persistent_cell.is_none();
            let dest_persistent = self
                .persistent_cell
                .get_or_insert_with(|| CellGroup::new(None, self.stamp));
            dest_persistent.merge_records(src_persistent, st);
            if dest_persistent.is_logically_empty()
                || (st.ii_skip_merge && was_newly_added)
                || (st.do_filter
                    && was_newly_added
                    && !st.block_passes(&src_persistent.collect_masters()))
            {
                self.persistent_cell = None;
            }
        }

        merge_cell_map(&mut self.cells, &mut src.cells, self.stamp, st);
    }

    pub fn update_records(&mut self, src: &WorldGroup, merge_ids: &mut FidSet) {
        merge::update_slot(&mut self.world, &src.world, merge_ids);
        merge::update_slot(&mut self.road, &src.road, merge_ids);
        if let (Some(dest_persistent), Some(src_persistent)) =
            (self.persistent_cell.as_mut(), src.persistent_cell.as_ref())
        {
            dest_persistent.update_records(src_persistent, merge_ids);
        }
        update_cell_map(&mut self.cells, &src.cells, merge_ids);
        self.touch();
    }

    /// 自底向上裁剪；任何子内容幸存都会把WRLD键写进keep集
    pub fn keep_records(&mut self, keep: &mut FidSet) {
        merge::keep_slot(&mut self.road, keep);
        if let Some(persistent) = self.persistent_cell.as_mut() {
            persistent.keep_records(keep);
            let cell_kept = persistent
                .cell
                .as_ref()
                .is_some_and(|c| keep.contains(&c.group_key()));
            if !cell_kept {
                self.persistent_cell = None;
            }
        }
        keep_cell_map(&mut self.cells, keep);
        if self.has_children() {
            if let Some(world) = &self.world {
                keep.insert(world.group_key());
            }
        }
        self.touch();
    }
}

/// WRLD顶级组
///
/// 野外数据常见无主的世界子组（锚WRLD从未出现），
/// 计数并跳过而非致命。
#[derive(Debug)]
pub struct WorldsTopGroup {
    pub header: GroupHeader,
    worlds: IndexMap<FormId, WorldGroup>,
    pub orphans_skipped: u32,
    computed_size: Option<u32>,
}

impl WorldsTopGroup {
    pub fn empty(header: GroupHeader) -> Self {
        WorldsTopGroup {
            header,
            worlds: IndexMap::new(),
            orphans_skipped: 0,
            computed_size: None,
        }
    }

    /// 解析WRLD顶级组内容（头部已读取）
    pub fn parse(header: GroupHeader, cursor: &mut Cursor<&[u8]>) -> Result<Self, EspError> {
        let mut group = WorldsTopGroup::empty(header);
        let end = cursor.position() + header.blob_size() as u64;
        let mut pending: Option<Record> = None;

        while cursor.position() < end {
            match unpack_header(cursor)? {
                Header::Record(rec_head) => {
                    if &rec_head.signature != b"WRLD" {
                        return Err(EspError::unexpected_record(
                            &rec_head.signature,
                            "WRLD Top Block",
                        ));
                    }
                    if let Some(world) = pending.take() {
                        // 连续两个WRLD：前一个没有子组，直接收尾
                        group.insert_loading(WorldGroup::new(Some(world), header.stamp))?;
                    }
                    pending = Some(Record::parse(rec_head, cursor)?);
                }
                Header::Group(sub) => {
                    if sub.group_type != GroupType::WorldChildren {
                        return Err(EspError::UnexpectedSubgroup {
                            group_type: sub.group_type.to_i32(),
                            context: "WRLD group".into(),
                        });
                    }
                    let label = sub.label.as_fid().unwrap_or(FormId(0));
                    match pending.take() {
                        Some(world) if world.group_key() == label => {
                            let block = WorldGroup::parse(sub, world, cursor)?;
                            group.insert_loading(block)?;
                        }
                        other => {
                            if let Some(world) = other {
                                group.insert_loading(WorldGroup::new(
                                    Some(world),
                                    header.stamp,
                                ))?;
                            }
                            // 此前收尾的无子组世界，子组后到：补挂
                            let childless = group
                                .worlds
                                .get(&label)
                                .is_some_and(|w| !w.has_children());
                            if childless {
                                if let Some(block) = group.worlds.shift_remove(&label) {
                                    if let Some(world) = block.world {
                                        let reparsed = WorldGroup::parse(sub, world, cursor)?;
                                        group.insert_loading(reparsed)?;
                                        continue;
                                    }
                                }
                            }
                            if group.worlds.contains_key(&label) {
                                return Err(EspError::duplicate_record(label, "WRLD Top Block"));
                            }
                            // 无主世界子组：计数并跳过
                            group.orphans_skipped += 1;
                            #[cfg(debug_assertions)]
                            eprintln!("警告: WRLD顶级组中发现无主子组 ({})，已跳过", label);
                            sub.skip_blob(cursor)?;
                        }
                    }
                }
            }
        }
        if let Some(world) = pending {
            group.insert_loading(WorldGroup::new(Some(world), header.stamp))?;
        }
        Ok(group)
    }

    fn insert_loading(&mut self, block: WorldGroup) -> Result<(), EspError> {
        let Some(fid) = block.group_key() else {
            return Ok(());
        };
        if self.worlds.contains_key(&fid) {
            return Err(EspError::duplicate_record(fid, "WRLD Top Block"));
        }
        self.worlds.insert(fid, block);
        Ok(())
    }

    fn touch(&mut self) {
        self.computed_size = None;
    }

    pub fn is_empty(&self) -> bool {
        self.worlds.is_empty()
    }

    pub fn len(&self) -> usize {
        self.worlds.len()
    }

    pub fn get_world(&self, fid: FormId) -> Option<&WorldGroup> {
        self.worlds.get(&fid)
    }

    /// 添加或覆盖世界块（程序化路径）
    pub fn set_world(&mut self, world: Record) -> &mut WorldGroup {
        self.touch();
        let fid = world.group_key();
        let stamp = self.header.stamp;
        match self.worlds.entry(fid) {
            indexmap::map::Entry::Occupied(entry) => {
                let block = entry.into_mut();
                block.world = Some(world);
                block
            }
            indexmap::map::Entry::Vacant(entry) => {
                entry.insert(WorldGroup::new(Some(world), stamp))
            }
        }
    }

    pub fn get_world_mut(&mut self, fid: FormId) -> Option<&mut WorldGroup> {
        self.touch();
        self.worlds.get_mut(&fid)
    }

    pub fn size(&mut self) -> Result<u32, EspError> {
        let size = if self.worlds.is_empty() {
            0
        } else {
            let mut total = HEADER_SIZE;
            for block in self.worlds.values_mut() {
                total += block.size()?;
            }
            total
        };
        self.computed_size = Some(size);
        Ok(size)
    }

    /// 序列化：预留大小字段，写完子内容后回填
    pub fn dump(&self, output: &mut Vec<u8>) -> Result<(), EspError> {
        self.computed_size.ok_or(EspError::SizeNotComputed)?;
        if self.worlds.is_empty() {
            return Ok(());
        }
        let header_pos = output.len();
        let mut header = self.header;
        header.size = 0;
        header.pack(output);

        let mut sorted: Vec<&WorldGroup> = self.worlds.values().collect();
        sorted.sort_by_key(|w| w.group_key());
        for block in sorted {
            block.dump(output)?;
        }

        let total = (output.len() - header_pos) as u32;
        output[header_pos + 4..header_pos + 8].copy_from_slice(&total.to_le_bytes());
        Ok(())
    }

    pub fn record_count(&self, include_groups: bool) -> usize {
        let count: usize = self
            .worlds
            .values()
            .map(|w| w.record_count(include_groups))
            .sum();
        if count == 0 {
            0
        } else {
            count + include_groups as usize
        }
    }

    pub fn records(&self) -> Vec<&Record> {
        self.worlds.values().flat_map(|w| w.records()).collect()
    }

    pub fn update_masters(&self, acc: &mut MasterSet) {
        for record in self.records() {
            record.update_masters(acc);
        }
    }

    pub fn merge_records(&mut self, src: &mut WorldsTopGroup, st: &mut MergeState) {
        let stamp = self.header.stamp;
        let mut filtered = IndexMap::new();
        for (fid, mut src_block) in src.worlds.drain(..) {
            let was_newly_added = !self.worlds.contains_key(&fid);
            if was_newly_added {
                self.worlds.insert(fid, WorldGroup::new(None, stamp));
            }
            let anchor_gone = match self.worlds.get_mut(&fid) {
                Some(dest_block) => {
                    dest_block.merge_records(&mut src_block, st);
                    dest_block.world.is_none()
                }
                None => false,
            };
            if anchor_gone {
                // 锚不在则组不在：IIM下新建的块锚从未被复制，一并撤除
                self.worlds.shift_remove(&fid);
                continue;
            }
            if st.ii_skip_merge {
                continue;
            }
            if st.do_filter && !st.block_passes(&src_block.collect_masters()) {
                if was_newly_added {
                    self.worlds.shift_remove(&fid);
                }
                continue;
            }
            filtered.insert(fid, src_block);
        }
        src.worlds = filtered;
        self.touch();
        src.touch();
    }

    pub fn update_records(&mut self, src: &WorldsTopGroup, merge_ids: &mut FidSet) {
        for (fid, src_block) in &src.worlds {
            if let Some(dest_block) = self.worlds.get_mut(fid) {
                dest_block.update_records(src_block, merge_ids);
            }
        }
        self.touch();
    }

    pub fn keep_records(&mut self, keep: &mut FidSet) {
        for block in self.worlds.values_mut() {
            block.keep_records(keep);
        }
        self.worlds.retain(|fid, _| keep.contains(fid));
        self.touch();
    }
}
