use crate::datatypes::{sig_to_str, RawString, RecordFlags, Signature};
use crate::groups::TopGroup;
use crate::headers::{unpack_header, GroupHeader, Header};
use crate::masters::{LoadSet, MasterSet};
use crate::merge::{FidSet, MergeState};
use crate::record::Record;
use crate::utils::{create_backup, EspError};
use indexmap::IndexMap;
use memmap2::Mmap;
use std::collections::HashSet;
use std::io::Cursor;
use std::path::{Path, PathBuf};

/// 顶级组加载策略
///
/// 决定哪些顶级组解析成结构、哪些作为惰性块原样携带。
/// 补丁流程只解析它要合并的组，其余组逐字节透传。
#[derive(Debug, Clone, Default)]
pub struct LoadPolicy {
    /// None = 全部解析
    unpack: Option<HashSet<Signature>>,
}

impl LoadPolicy {
    /// 解析全部顶级组
    pub fn all() -> Self {
        LoadPolicy { unpack: None }
    }

    /// 只解析给定签名的顶级组
    pub fn only(sigs: impl IntoIterator<Item = Signature>) -> Self {
        LoadPolicy {
            unpack: Some(sigs.into_iter().collect()),
        }
    }

    /// 全部作为惰性块携带（纯透传）
    pub fn none() -> Self {
        Self::only([])
    }

    pub fn should_unpack(&self, sig: &Signature) -> bool {
        match &self.unpack {
            None => true,
            Some(set) => set.contains(sig),
        }
    }
}

/// ESP插件的内存树
///
/// TES4头部记录加按签名分发的顶级组集合。合并、更新、裁剪
/// 都在这棵树上原位进行，然后整树序列化回磁盘布局。
#[derive(Debug)]
pub struct Plugin {
    /// 文件路径
    pub path: PathBuf,
    /// TES4头部记录
    pub header: Record,
    /// 顶级组（按签名，保持文件顺序）
    pub tops: IndexMap<Signature, TopGroup>,
    /// 主文件列表
    pub masters: Vec<String>,
}

impl Plugin {
    /// 加载插件文件（全部顶级组解析）
    pub fn load(path: PathBuf) -> Result<Self, Box<dyn std::error::Error>> {
        Self::load_with_policy(path, &LoadPolicy::all())
    }

    /// 按加载策略加载插件文件
    ///
    /// 使用内存映射读取，零拷贝解析。
    pub fn load_with_policy(
        path: PathBuf,
        policy: &LoadPolicy,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let file = std::fs::File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self::from_bytes(path, &mmap[..], policy)?)
    }

    /// 从字节流解析插件
    pub fn from_bytes(
        path: PathBuf,
        data: &[u8],
        policy: &LoadPolicy,
    ) -> Result<Self, EspError> {
        let mut cursor = Cursor::new(data);
        let head = match unpack_header(&mut cursor)? {
            Header::Record(head) if &head.signature == b"TES4" => head,
            _ => return Err(EspError::InvalidFormat),
        };
        let header = Record::parse(head, &mut cursor)?;
        let masters = Self::extract_masters(&header);

        let mut tops: IndexMap<Signature, TopGroup> = IndexMap::new();
        while (cursor.position() as usize) < data.len() {
            let group_header = GroupHeader::parse(&mut cursor)?;
            let sig = group_header
                .label
                .as_signature()
                .ok_or_else(|| EspError::Corrupt("Top group without signature label".into()))?;
            if tops.contains_key(&sig) {
                return Err(EspError::DuplicateRecord {
                    key: sig_to_str(&sig),
                    context: "top level".into(),
                });
            }
            let top = TopGroup::parse(group_header, &mut cursor, policy.should_unpack(&sig))?;
            tops.insert(sig, top);
        }

        Ok(Plugin {
            path,
            header,
            tops,
            masters,
        })
    }

    /// 从TES4头部提取主文件列表
    fn extract_masters(header: &Record) -> Vec<String> {
        header
            .subrecords
            .iter()
            .filter(|sr| &sr.signature == b"MAST")
            .map(|sr| RawString::parse_zstring(&sr.data).content)
            .collect()
    }

    /// 本插件视角的加载集：全部主文件加自身
    pub fn load_set(&self) -> LoadSet {
        LoadSet::first(self.masters.len() + 1)
    }

    /// 获取插件名称
    pub fn get_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// 是否为主文件
    pub fn is_master(&self) -> bool {
        self.header.flags().contains(RecordFlags::MASTER_FILE)
    }

    /// 从源插件合并记录
    ///
    /// 逐顶级组委托合并；目标缺的顶级组先建空组。源插件的
    /// 成员资格被破坏性过滤（Filter模式），调用方据此得知
    /// 哪些记录通过了过滤。
    pub fn merge_plugin(
        &mut self,
        src: &mut Plugin,
        load_set: &LoadSet,
        merge_ids: &mut FidSet,
        ii_skip_merge: bool,
        do_filter: bool,
    ) {
        for (sig, src_top) in src.tops.iter_mut() {
            let dest_top = self
                .tops
                .entry(*sig)
                .or_insert_with(|| TopGroup::empty(*sig, src_top.header().stamp));
            let mut st = MergeState {
                load_set,
                merge_ids,
                ii_skip_merge,
                do_filter,
            };
            dest_top.merge_records(src_top, &mut st);
        }
    }

    /// 用源插件更新双方都有的记录（不增长）
    pub fn update_from(&mut self, src: &Plugin, merge_ids: &mut FidSet) {
        for (sig, src_top) in &src.tops {
            if let Some(dest_top) = self.tops.get_mut(sig) {
                dest_top.update_records(src_top, merge_ids);
            }
        }
    }

    /// 裁剪整树，只留keep集点名的记录（锚按两段式规则恢复）
    pub fn keep_records(&mut self, keep: &mut FidSet) {
        for top in self.tops.values_mut() {
            top.keep_records(keep);
        }
    }

    pub fn update_masters(&self, acc: &mut MasterSet) {
        for top in self.tops.values() {
            top.update_masters(acc);
        }
    }

    /// 序列化整树
    ///
    /// 先自顶向下重算全部组大小，再写出；空组整体省略。
    pub fn to_bytes(&mut self) -> Result<Vec<u8>, EspError> {
        let mut output = Vec::new();
        self.header.dump(&mut output)?;
        for top in self.tops.values_mut() {
            top.size()?;
        }
        for top in self.tops.values() {
            top.dump(&mut output)?;
        }
        Ok(output)
    }

    /// 写入文件；目标已存在时先做时间戳备份
    pub fn write_to_file(&mut self, path: &Path) -> Result<(), EspError> {
        let output = self.to_bytes()?;
        if path.exists() {
            let _backup = create_backup(path)?;
            #[cfg(debug_assertions)]
            println!("已创建备份文件: {:?}", _backup);
        }
        std::fs::write(path, output)?;
        Ok(())
    }

    /// 统计记录数量（含头部记录与组头部）
    pub fn count_records(&self) -> Result<usize, EspError> {
        let mut count = 1; // TES4
        for top in self.tops.values() {
            count += top.record_count(true)?;
        }
        Ok(count)
    }

    /// 获取统计信息
    pub fn get_stats(&self) -> Result<PluginStats, EspError> {
        let mut records = 0;
        for top in self.tops.values() {
            records += top.record_count(false)?;
        }
        let orphans = self
            .tops
            .values()
            .map(|t| match t {
                TopGroup::Worlds(w) => w.orphans_skipped,
                TopGroup::InteriorCells(c) => c.orphans_skipped,
                TopGroup::Dialogues(d) => d.orphans_skipped,
                _ => 0,
            })
            .sum();
        Ok(PluginStats {
            name: self.get_name(),
            is_master: self.is_master(),
            master_count: self.masters.len(),
            top_group_count: self.tops.len(),
            record_count: records,
            orphans_skipped: orphans,
        })
    }
}

/// 插件统计信息
pub struct PluginStats {
    pub name: String,
    pub is_master: bool,
    pub master_count: usize,
    pub top_group_count: usize,
    pub record_count: usize,
    pub orphans_skipped: u32,
}

impl std::fmt::Display for PluginStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== 插件统计信息 ===")?;
        writeln!(f, "名称: {}", self.name)?;
        writeln!(f, "主文件: {}", if self.is_master { "是" } else { "否" })?;
        writeln!(f, "依赖主文件数: {}", self.master_count)?;
        writeln!(f, "顶级组数量: {}", self.top_group_count)?;
        writeln!(f, "记录数量: {}", self.record_count)?;
        writeln!(f, "跳过的无主子组: {}", self.orphans_skipped)?;
        Ok(())
    }
}
