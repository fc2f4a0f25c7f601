use std::collections::HashSet;

/// 记录实际引用到的主文件索引集合
///
/// 由 `Record::update_masters` 逐条累加，再与 `LoadSet` 比对，
/// 决定过滤合并时一条记录能否保留。
#[derive(Debug, Default, Clone)]
pub struct MasterSet {
    indices: HashSet<u8>,
}

impl MasterSet {
    pub fn add(&mut self, index: u8) {
        self.indices.insert(index);
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.indices.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// 当前已加载主文件的索引集合
#[derive(Debug, Default, Clone)]
pub struct LoadSet {
    indices: HashSet<u8>,
}

impl LoadSet {
    pub fn new(indices: impl IntoIterator<Item = u8>) -> Self {
        LoadSet {
            indices: indices.into_iter().collect(),
        }
    }

    /// 前 count 个索引全部视为已加载（基础插件及其全部主文件）
    pub fn first(count: usize) -> Self {
        Self::new((0..count.min(256)).map(|i| i as u8))
    }

    pub fn contains(&self, index: u8) -> bool {
        self.indices.contains(&index)
    }

    /// 是否覆盖了记录引用到的全部主文件
    pub fn is_superset(&self, masters: &MasterSet) -> bool {
        masters.iter().all(|i| self.indices.contains(&i))
    }
}
