use crate::datatypes::FormId;
use crate::masters::{LoadSet, MasterSet};
use crate::record::Record;
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};

/// FormID集合（merged-id / keep-id 集）
pub type FidSet = HashSet<FormId>;

/// 一次合并操作的共享状态
///
/// `do_filter`：Filter标签模式，记录先按加载集过滤再决定去留；
/// `ii_skip_merge`：IIM模式，只做过滤、不向目标复制。
pub struct MergeState<'a> {
    pub load_set: &'a LoadSet,
    pub merge_ids: &'a mut FidSet,
    pub ii_skip_merge: bool,
    pub do_filter: bool,
}

impl MergeState<'_> {
    /// 过滤并判定一条记录能否保留
    ///
    /// Filter模式下先对记录做合并过滤，再检查它剩余的引用
    /// 是否全部落在加载集内。非Filter模式恒为真。
    pub fn filter_keeps(&self, record: &mut Record) -> bool {
        if !self.do_filter {
            return true;
        }
        record.merge_filter(self.load_set);
        let mut masters = MasterSet::default();
        record.update_masters(&mut masters);
        self.load_set.is_superset(&masters)
    }

    /// 整个子块的引用是否全部被加载集覆盖
    pub fn block_passes(&self, masters: &MasterSet) -> bool {
        !self.do_filter || self.load_set.is_superset(masters)
    }
}

/// 锚记录合并的结果，决定父级是否继续合并子组
#[derive(Debug, PartialEq, Eq)]
pub enum AnchorOutcome {
    /// 源锚缺失或被忽略，整个复合组不处理
    Skip,
    /// 锚被过滤掉，目标复合组应从父级撤除
    FilteredOut,
    /// 锚已处理（IIM下不复制），继续合并子组
    Merge,
}

/// 合并锚记录槽
///
/// 锚被过滤掉时清空目标锚：复合组由锚定义，锚不在则组不在，
/// 由调用方负责把空组从父级映射里撤除。
pub fn merge_anchor(
    dest: &mut Option<Record>,
    src: &mut Option<Record>,
    st: &mut MergeState,
) -> AnchorOutcome {
    let Some(src_rec) = src.as_mut() else {
        return AnchorOutcome::Skip;
    };
    if src_rec.is_ignored() {
        return AnchorOutcome::Skip;
    }
    if !st.filter_keeps(src_rec) {
        *dest = None;
        return AnchorOutcome::FilteredOut;
    }
    if !st.ii_skip_merge {
        st.merge_ids.insert(src_rec.group_key());
        *dest = Some(src_rec.get_type_copy());
    }
    AnchorOutcome::Merge
}

/// 合并普通单记录槽（ROAD/LAND/PGRD）
///
/// 被过滤掉的槽记录从源中清掉，目标不动。
pub fn merge_slot(dest: &mut Option<Record>, src: &mut Option<Record>, st: &mut MergeState) {
    let Some(src_rec) = src.as_mut() else {
        return;
    };
    if src_rec.is_ignored() {
        return;
    }
    if !st.filter_keeps(src_rec) {
        *src = None;
        return;
    }
    if !st.ii_skip_merge {
        st.merge_ids.insert(src_rec.group_key());
        *dest = Some(src_rec.get_type_copy());
    }
}

/// 合并平坦记录映射
///
/// 按源的现有顺序迭代。通过过滤的记录留在源的存活成员里
/// （源的成员资格在此被破坏性重建），复制进目标时覆盖同键项。
pub fn merge_keyed(
    dest: &mut IndexMap<FormId, Record>,
    src: &mut IndexMap<FormId, Record>,
    st: &mut MergeState,
) {
    let mut filtered = IndexMap::new();
    for (rid, mut src_rec) in src.drain(..) {
        if src_rec.is_ignored() {
            continue;
        }
        if !st.filter_keeps(&mut src_rec) {
            continue;
        }
        if !st.ii_skip_merge {
            st.merge_ids.insert(rid);
            dest.insert(rid, src_rec.get_type_copy());
        }
        filtered.insert(rid, src_rec);
    }
    *src = filtered;
}

/// 合并引用序列（单元格的三个引用桶）
///
/// 目标里已有同键记录则原位替换，否则追加。
pub fn merge_ref_list(dest: &mut Vec<Record>, src: &mut Vec<Record>, st: &mut MergeState) {
    let index: HashMap<FormId, usize> = dest
        .iter()
        .enumerate()
        .map(|(i, r)| (r.group_key(), i))
        .collect();
    let mut filtered = Vec::new();
    for mut src_rec in src.drain(..) {
        if src_rec.is_ignored() {
            continue;
        }
        if !st.filter_keeps(&mut src_rec) {
            continue;
        }
        if !st.ii_skip_merge {
            let rid = src_rec.group_key();
            st.merge_ids.insert(rid);
            let rec_copy = src_rec.get_type_copy();
            match index.get(&rid) {
                Some(&i) => dest[i] = rec_copy,
                None => dest.push(rec_copy),
            }
        }
        filtered.push(src_rec);
    }
    *src = filtered;
}

/// 更新单记录槽：目标有才更新，更新不使目标增长
pub fn update_slot(dest: &mut Option<Record>, src: &Option<Record>, merge_ids: &mut FidSet) {
    if let (Some(dest_rec), Some(src_rec)) = (dest.as_mut(), src.as_ref()) {
        if !src_rec.is_ignored() {
            *dest_rec = src_rec.get_type_copy();
            merge_ids.remove(&src_rec.group_key());
        }
    }
}

/// 更新平坦记录映射：只替换双方都有的键
pub fn update_keyed(
    dest: &mut IndexMap<FormId, Record>,
    src: &IndexMap<FormId, Record>,
    merge_ids: &mut FidSet,
) {
    for (rid, src_rec) in src {
        if src_rec.is_ignored() {
            continue;
        }
        if let Some(slot) = dest.get_mut(rid) {
            *slot = src_rec.get_type_copy();
            merge_ids.remove(rid);
        }
    }
}

/// 更新引用序列：只替换双方都有的键
pub fn update_ref_list(dest: &mut Vec<Record>, src: &[Record], merge_ids: &mut FidSet) {
    let index: HashMap<FormId, usize> = dest
        .iter()
        .enumerate()
        .map(|(i, r)| (r.group_key(), i))
        .collect();
    for src_rec in src {
        if src_rec.is_ignored() {
            continue;
        }
        if let Some(&i) = index.get(&src_rec.group_key()) {
            dest[i] = src_rec.get_type_copy();
            merge_ids.remove(&src_rec.group_key());
        }
    }
}

/// 裁剪平坦记录映射
pub fn keep_keyed(map: &mut IndexMap<FormId, Record>, keep: &FidSet) {
    map.retain(|rid, _| keep.contains(rid));
}

/// 裁剪单记录槽
pub fn keep_slot(slot: &mut Option<Record>, keep: &FidSet) {
    if slot.as_ref().is_some_and(|r| !keep.contains(&r.group_key())) {
        *slot = None;
    }
}

/// 裁剪引用序列
pub fn keep_ref_list(list: &mut Vec<Record>, keep: &FidSet) {
    list.retain(|r| keep.contains(&r.group_key()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatypes::RecordFlags;
    use crate::subrecord::Subrecord;

    fn rec(fid: u32) -> Record {
        Record::new(*b"GMST", FormId(fid), 0, vec![])
    }

    fn keyed(fids: &[u32]) -> IndexMap<FormId, Record> {
        fids.iter().map(|&f| (FormId(f), rec(f))).collect()
    }

    #[test]
    fn test_merge_keyed_adds_and_overwrites() {
        let mut dest = keyed(&[1]);
        let mut src = keyed(&[5, 1, 3]);
        let load_set = LoadSet::first(1);
        let mut merge_ids = FidSet::new();
        let mut st = MergeState {
            load_set: &load_set,
            merge_ids: &mut merge_ids,
            ii_skip_merge: false,
            do_filter: false,
        };
        merge_keyed(&mut dest, &mut src, &mut st);

        assert_eq!(dest.len(), 3);
        assert_eq!(merge_ids.len(), 3, "每个源键都应进入merged-id集");
        // 源顺序保持插入顺序，不按键排序
        let src_order: Vec<FormId> = src.keys().copied().collect();
        assert_eq!(src_order, vec![FormId(5), FormId(1), FormId(3)]);
    }

    #[test]
    fn test_merge_keyed_iim_copies_nothing() {
        let mut dest = keyed(&[]);
        let mut src = keyed(&[1, 2]);
        let load_set = LoadSet::first(1);
        let mut merge_ids = FidSet::new();
        let mut st = MergeState {
            load_set: &load_set,
            merge_ids: &mut merge_ids,
            ii_skip_merge: true,
            do_filter: true,
        };
        merge_keyed(&mut dest, &mut src, &mut st);

        assert!(dest.is_empty(), "IIM模式不得向目标复制");
        assert!(merge_ids.is_empty(), "IIM模式不得记录merged-id");
        assert_eq!(src.len(), 2, "过滤结果仍应保留在源中");
    }

    #[test]
    fn test_merge_keyed_filter_mutates_source() {
        // FormID主索引1超出加载集{0}
        let mut dest = keyed(&[]);
        let mut src: IndexMap<FormId, Record> = IndexMap::new();
        src.insert(FormId(0x0100_0001), rec(0x0100_0001));
        src.insert(FormId(0x2), rec(0x2));

        let load_set = LoadSet::first(1);
        let mut merge_ids = FidSet::new();
        let mut st = MergeState {
            load_set: &load_set,
            merge_ids: &mut merge_ids,
            ii_skip_merge: false,
            do_filter: true,
        };
        merge_keyed(&mut dest, &mut src, &mut st);

        assert_eq!(src.len(), 1, "被过滤的记录必须从源成员中消失");
        assert!(src.contains_key(&FormId(0x2)));
        assert_eq!(dest.len(), 1);
    }

    #[test]
    fn test_merge_skips_ignored() {
        let mut dest = keyed(&[]);
        let mut src: IndexMap<FormId, Record> = IndexMap::new();
        src.insert(
            FormId(9),
            Record::new(*b"GMST", FormId(9), RecordFlags::IGNORED.bits(), vec![]),
        );
        let load_set = LoadSet::first(1);
        let mut merge_ids = FidSet::new();
        let mut st = MergeState {
            load_set: &load_set,
            merge_ids: &mut merge_ids,
            ii_skip_merge: false,
            do_filter: false,
        };
        merge_keyed(&mut dest, &mut src, &mut st);
        assert!(dest.is_empty());
        assert!(src.is_empty(), "忽略标志的记录不进入存活成员");
    }

    #[test]
    fn test_update_never_grows() {
        let mut dest = keyed(&[1]);
        let src = keyed(&[1, 2]);
        let mut merge_ids: FidSet = [FormId(1), FormId(2)].into_iter().collect();
        update_keyed(&mut dest, &src, &mut merge_ids);

        assert_eq!(dest.len(), 1, "update不得添加新键");
        assert!(!merge_ids.contains(&FormId(1)), "被更新的键应从待合并集中移除");
        assert!(merge_ids.contains(&FormId(2)));
    }

    #[test]
    fn test_merge_anchor_filtered_out_clears_dest() {
        let mut dest = Some(rec(1));
        let mut src = Some(Record::new(
            *b"DIAL",
            FormId(0x0500_0001),
            0,
            vec![Subrecord::new(
                *b"QSTI",
                0x0500_0002u32.to_le_bytes().to_vec(),
            )],
        ));
        let load_set = LoadSet::first(1);
        let mut merge_ids = FidSet::new();
        let mut st = MergeState {
            load_set: &load_set,
            merge_ids: &mut merge_ids,
            ii_skip_merge: false,
            do_filter: true,
        };
        let outcome = merge_anchor(&mut dest, &mut src, &mut st);
        assert_eq!(outcome, AnchorOutcome::FilteredOut);
        assert!(dest.is_none(), "锚被过滤后目标复合组应整体消失");
    }

    #[test]
    fn test_merge_ref_list_replaces_in_place() {
        let mut dest = vec![rec(1), rec(2)];
        let mut src = vec![rec(2), rec(3)];
        let load_set = LoadSet::first(1);
        let mut merge_ids = FidSet::new();
        let mut st = MergeState {
            load_set: &load_set,
            merge_ids: &mut merge_ids,
            ii_skip_merge: false,
            do_filter: false,
        };
        merge_ref_list(&mut dest, &mut src, &mut st);
        let order: Vec<FormId> = dest.iter().map(|r| r.group_key()).collect();
        assert_eq!(
            order,
            vec![FormId(1), FormId(2), FormId(3)],
            "同键原位替换，新键追加到末尾"
        );
    }

    #[test]
    fn test_keep_monotonicity() {
        let small: FidSet = [FormId(1)].into_iter().collect();
        let large: FidSet = [FormId(1), FormId(3)].into_iter().collect();

        let mut kept_small = keyed(&[1, 2, 3]);
        let mut kept_large = keyed(&[1, 2, 3]);
        keep_keyed(&mut kept_small, &small);
        keep_keyed(&mut kept_large, &large);
        assert!(
            kept_small.len() <= kept_large.len(),
            "keep集是子集时保留的记录不得更多"
        );
        assert!(kept_small.keys().all(|k| kept_large.contains_key(k)));
    }
}
