//! 合并引擎集成测试
//!
//! 用程序化构造的合成插件走完整流程：
//! - 建树 → 写盘 → 重新加载 → 合并 → 再写盘 → 校验
//! - 惰性透传、Filter/IIM模式、裁剪（补丁收尾）都各有场景
//!
//! 全部文件都是临时目录里的合成数据，测试自包含。

use esp_merger::datatypes::RecordFlags;
use esp_merger::{
    FidSet, FormId, LoadPolicy, LoadSet, Plugin, Record, Subrecord, TopGroup,
};
use std::path::{Path, PathBuf};

fn tes4(masters: &[&str]) -> Record {
    let mut subrecords = vec![Subrecord::new(*b"HEDR", vec![0; 12])];
    for name in masters {
        let mut data = name.as_bytes().to_vec();
        data.push(0);
        subrecords.push(Subrecord::new(*b"MAST", data));
        subrecords.push(Subrecord::new(*b"DATA", vec![0; 8]));
    }
    Record::new(*b"TES4", FormId(0), 0, subrecords)
}

fn gmst(fid: u32, value: &str) -> Record {
    let mut data = value.as_bytes().to_vec();
    data.push(0);
    Record::new(
        *b"GMST",
        FormId(fid),
        0,
        vec![Subrecord::new(*b"EDID", data)],
    )
}

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

fn wrld(fid: u32) -> Record {
    Record::new(*b"WRLD", FormId(fid), 0, vec![])
}

fn exterior_cell(fid: u32, x: i32, y: i32, persistent: bool) -> Record {
    let mut grid = Vec::new();
    grid.extend_from_slice(&x.to_le_bytes());
    grid.extend_from_slice(&y.to_le_bytes());
    let flags = if persistent {
        RecordFlags::PERSISTENT.bits()
    } else {
        0
    };
    Record::new(
        *b"CELL",
        FormId(fid),
        flags,
        vec![
            Subrecord::new(*b"DATA", vec![0x02]),
            Subrecord::new(*b"XCLC", grid),
        ],
    )
}

fn refr(fid: u32) -> Record {
    Record::new(*b"REFR", FormId(fid), 0, vec![])
}

/// 向插件添加一个平坦顶级组
fn add_flat_top(plugin: &mut Plugin, sig: [u8; 4], records: Vec<Record>) {
    let mut top = TopGroup::empty(sig, 0);
    if let TopGroup::Records(group) = &mut top {
        for record in records {
            group.set_record(record);
        }
    }
    plugin.tops.insert(sig, top);
}

/// 程序化建树并写盘，返回文件路径
fn write_plugin(
    dir: &Path,
    name: &str,
    masters: &[&str],
    build: impl FnOnce(&mut Plugin),
) -> PathBuf {
    let path = dir.join(name);
    let mut plugin = Plugin {
        path: path.clone(),
        header: tes4(masters),
        tops: Default::default(),
        masters: masters.iter().map(|m| m.to_string()).collect(),
    };
    build(&mut plugin);
    plugin.write_to_file(&path).expect("应该能写出合成插件");
    path
}

#[test]
fn test_full_merge_flow() {
    let dir = tempfile::tempdir().unwrap();

    let base_path = write_plugin(dir.path(), "base.esp", &[], |plugin| {
        add_flat_top(plugin, *b"GMST", vec![gmst(1, "fGravity")]);
    });

    let src_path = write_plugin(dir.path(), "source.esp", &[], |plugin| {
        add_flat_top(plugin, *b"GMST", vec![gmst(2, "fJumpHeight"), gmst(1, "fGravity2")]);

        let mut top = TopGroup::empty(*b"DIAL", 0);
        if let TopGroup::Dialogues(dials) = &mut top {
            let block = dials.set_dial(dial(0x10));
            // 输入顺序故意前驱在后
            block.set_info(info(0x22, Some(0x21)));
            block.set_info(info(0x21, None));
        }
        plugin.tops.insert(*b"DIAL", top);

        let mut top = TopGroup::empty(*b"WRLD", 0);
        if let TopGroup::Worlds(worlds) = &mut top {
            let world_block = worlds.set_world(wrld(0x30));
            world_block.road = Some(Record::new(*b"ROAD", FormId(0x31), 0, vec![]));
            world_block.set_persistent_cell(exterior_cell(0x32, 0, 0, true));
            world_block.set_cell(exterior_cell(0x33, 5, -9, false));
            if let Some(block) = world_block.get_cell_mut(FormId(0x33)) {
                block.temp_refs.push(refr(0x34));
            }
        }
        plugin.tops.insert(*b"WRLD", top);
    });

    let mut base = Plugin::load(base_path).expect("应该能加载基础插件");
    let mut source = Plugin::load(src_path).expect("应该能加载源插件");

    let load_set = base.load_set();
    let mut merge_ids = FidSet::new();
    base.merge_plugin(&mut source, &load_set, &mut merge_ids, false, false);

    for fid in [1u32, 2, 0x10, 0x21, 0x22, 0x30, 0x31, 0x32, 0x33, 0x34] {
        assert!(merge_ids.contains(&FormId(fid)), "{:X} 应进入merged-id集", fid);
    }

    // 写出合并结果再读回
    let out_path = dir.path().join("merged.esp");
    base.write_to_file(&out_path).unwrap();
    let merged = Plugin::load(out_path).expect("应该能重新加载合并结果");

    // 平坦组按键排序
    let gmst_top = &merged.tops[b"GMST".as_slice()];
    let order: Vec<FormId> = gmst_top.records().iter().map(|r| r.group_key()).collect();
    assert_eq!(order, vec![FormId(1), FormId(2)]);

    // 响应按前驱依赖序写出
    let TopGroup::Dialogues(dials) = &merged.tops[b"DIAL".as_slice()] else {
        panic!("DIAL顶级组应解析为对话变体");
    };
    let dial_block = dials.get_dial(FormId(0x10)).expect("DIAL 0x10 应存在");
    let info_order: Vec<FormId> = dial_block
        .records()
        .iter()
        .skip(1)
        .map(|r| r.group_key())
        .collect();
    assert_eq!(info_order, vec![FormId(0x21), FormId(0x22)]);

    // 世界结构完整
    let TopGroup::Worlds(worlds) = &merged.tops[b"WRLD".as_slice()] else {
        panic!("WRLD顶级组应解析为世界变体");
    };
    let world_block = worlds.get_world(FormId(0x30)).expect("WRLD 0x30 应存在");
    assert!(world_block.road.is_some());
    assert!(world_block.persistent_cell.is_some(), "常驻CELL应回到常驻槽");
    let cell_block = world_block.cells().get(&FormId(0x33)).expect("普通单元格应存在");
    assert_eq!(cell_block.temp_refs.len(), 1);

    println!("合并结果共 {} 条记录", merged.count_records().unwrap());
}

#[test]
fn test_lazy_passthrough_bytes_identical() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_plugin(dir.path(), "plugin.esp", &["Oblivion.esm"], |plugin| {
        add_flat_top(plugin, *b"GMST", vec![gmst(5, "c"), gmst(1, "a"), gmst(3, "b")]);
        add_flat_top(plugin, *b"WEAP", vec![Record::new(*b"WEAP", FormId(9), 0, vec![])]);
    });
    let original = std::fs::read(&path).unwrap();

    // 纯透传：不解析任何顶级组
    let mut plugin = Plugin::load_with_policy(path, &LoadPolicy::none()).unwrap();
    for top in plugin.tops.values() {
        assert!(!top.is_dirty(), "惰性块不算变更");
    }
    let out_path = dir.path().join("copy.esp");
    plugin.write_to_file(&out_path).unwrap();
    let copied = std::fs::read(&out_path).unwrap();
    assert_eq!(copied, original, "未触碰的组必须位级往返");

    // 选择性解析：只解析GMST，WEAP仍透传
    let policy = LoadPolicy::only([*b"GMST"]);
    let plugin = Plugin::load_with_policy(out_path, &policy).unwrap();
    assert!(plugin.tops[b"GMST".as_slice()].is_dirty());
    assert!(!plugin.tops[b"WEAP".as_slice()].is_dirty());
}

#[test]
fn test_filter_merge_drops_foreign_records() {
    let dir = tempfile::tempdir().unwrap();
    let base_path = write_plugin(dir.path(), "base.esp", &[], |plugin| {
        add_flat_top(plugin, *b"GMST", vec![]);
    });
    // 源里有一条记录属于未加载的主文件索引1
    let src_path = write_plugin(dir.path(), "source.esp", &["Missing.esm"], |plugin| {
        add_flat_top(
            plugin,
            *b"GMST",
            vec![gmst(0x0100_0007, "foreign"), gmst(0x0000_0008, "local")],
        );
    });

    let mut base = Plugin::load(base_path).unwrap();
    let mut source = Plugin::load(src_path).unwrap();

    // 加载集只有索引0（基础插件自身）
    let load_set = LoadSet::first(1);
    let mut merge_ids = FidSet::new();
    base.merge_plugin(&mut source, &load_set, &mut merge_ids, false, true);

    assert!(merge_ids.contains(&FormId(0x8)));
    assert!(!merge_ids.contains(&FormId(0x0100_0007)), "外部记录不得合并");

    let dest_top = &base.tops[b"GMST".as_slice()];
    assert_eq!(dest_top.records().len(), 1);

    // 过滤是破坏性的：源容器的成员资格同步缩减
    let src_top = &source.tops[b"GMST".as_slice()];
    let survivors: Vec<FormId> = src_top.records().iter().map(|r| r.group_key()).collect();
    assert_eq!(survivors, vec![FormId(0x8)], "被过滤的记录必须从源中消失");
}

#[test]
fn test_iim_merge_copies_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let base_path = write_plugin(dir.path(), "base.esp", &[], |plugin| {
        add_flat_top(plugin, *b"GMST", vec![]);
    });
    let src_path = write_plugin(dir.path(), "source.esp", &[], |plugin| {
        add_flat_top(plugin, *b"GMST", vec![gmst(0x7, "x")]);
    });

    let mut base = Plugin::load(base_path).unwrap();
    let mut source = Plugin::load(src_path).unwrap();

    let load_set = LoadSet::first(1);
    let mut merge_ids = FidSet::new();
    base.merge_plugin(&mut source, &load_set, &mut merge_ids, true, true);

    assert!(merge_ids.is_empty(), "IIM模式不得记录merged-id");
    assert!(base.tops[b"GMST".as_slice()].records().is_empty(), "IIM模式不得向目标复制");
    // 过滤照常进行，源的存活成员保留
    assert_eq!(source.tops[b"GMST".as_slice()].records().len(), 1);
}

#[test]
fn test_keep_records_trims_patch() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_plugin(dir.path(), "patch.esp", &[], |plugin| {
        add_flat_top(plugin, *b"GMST", vec![gmst(1, "a"), gmst(2, "b")]);

        let mut top = TopGroup::empty(*b"DIAL", 0);
        if let TopGroup::Dialogues(dials) = &mut top {
            let block = dials.set_dial(dial(0x10));
            block.set_info(info(0x11, None));
            let block = dials.set_dial(dial(0x20));
            block.set_info(info(0x21, None));
        }
        plugin.tops.insert(*b"DIAL", top);
    });

    let mut plugin = Plugin::load(path).unwrap();
    // 只点名GMST 1 和 INFO 0x11；DIAL 0x10 靠幸存响应恢复
    let mut keep: FidSet = [FormId(1), FormId(0x11)].into_iter().collect();
    plugin.keep_records(&mut keep);
    assert!(keep.contains(&FormId(0x10)), "锚键应被两段式裁剪补进keep集");

    let out_path = dir.path().join("trimmed.esp");
    plugin.write_to_file(&out_path).unwrap();
    let trimmed = Plugin::load(out_path).unwrap();

    let order: Vec<FormId> = trimmed.tops[b"GMST".as_slice()]
        .records()
        .iter()
        .map(|r| r.group_key())
        .collect();
    assert_eq!(order, vec![FormId(1)]);

    let TopGroup::Dialogues(dials) = &trimmed.tops[b"DIAL".as_slice()] else {
        panic!("DIAL顶级组应解析为对话变体");
    };
    assert_eq!(dials.len(), 1, "无幸存响应且未点名的对话块整体消失");
    assert!(dials.get_dial(FormId(0x10)).is_some());
}

#[test]
fn test_overwrite_creates_backup() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_plugin(dir.path(), "out.esp", &[], |plugin| {
        add_flat_top(plugin, *b"GMST", vec![gmst(1, "a")]);
    });

    // 第二次写同一路径：先备份
    let mut plugin = Plugin::load(path.clone()).unwrap();
    plugin.write_to_file(&path).unwrap();

    let backups: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("bak"))
        .collect();
    assert_eq!(backups.len(), 1, "覆盖已有文件前应创建备份");
}
