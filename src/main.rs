use anyhow::Context;
use clap::Parser;
use esp_merger::{FidSet, LoadPolicy, LoadSet, Plugin, SUPPORTED_EXTENSIONS};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "esp_merger")]
#[command(about = "把多个ESP/ESM插件的记录组合并进一个基础插件")]
#[command(version)]
struct Cli {
    /// 基础插件路径（合并目标）
    #[arg(short, long)]
    base: PathBuf,

    /// 源插件路径（按给定顺序依次合并）
    #[arg(short, long, num_args = 1..)]
    source: Vec<PathBuf>,

    /// 输出文件路径
    #[arg(short, long)]
    output: PathBuf,

    /// Filter模式：记录先按加载集过滤再合并
    #[arg(long)]
    filter: bool,

    /// IIM模式：只做过滤，不向目标复制
    #[arg(long)]
    iim: bool,

    /// 只解析给定签名的顶级组（其余原样透传），如 --only GMST --only WEAP
    #[arg(long)]
    only: Vec<String>,

    /// 显示插件统计信息
    #[arg(long)]
    stats: bool,

    /// 静默模式(仅输出错误)
    #[arg(long)]
    quiet: bool,
}

fn check_extension(path: &PathBuf) -> anyhow::Result<()> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    anyhow::ensure!(
        SUPPORTED_EXTENSIONS.contains(&ext.as_str()),
        "不支持的文件类型: {:?} (支持 {:?})",
        path,
        SUPPORTED_EXTENSIONS
    );
    Ok(())
}

fn build_policy(only: &[String]) -> anyhow::Result<LoadPolicy> {
    if only.is_empty() {
        return Ok(LoadPolicy::all());
    }
    let mut sigs = Vec::new();
    for name in only {
        let bytes = name.as_bytes();
        anyhow::ensure!(bytes.len() == 4, "签名必须是4个字符: {}", name);
        let mut sig = [0u8; 4];
        sig.copy_from_slice(bytes);
        sigs.push(sig);
    }
    Ok(LoadPolicy::only(sigs))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    check_extension(&cli.base)?;
    for source in &cli.source {
        check_extension(source)?;
    }

    let policy = build_policy(&cli.only)?;
    let mut base = Plugin::load_with_policy(cli.base.clone(), &policy)
        .map_err(|e| anyhow::anyhow!("{}", e))
        .with_context(|| format!("无法加载基础插件 {:?}", cli.base))?;

    if cli.stats && !cli.quiet {
        println!("{}", base.get_stats().context("统计失败")?);
    }

    // 加载集：基础插件的全部主文件加自身
    let load_set: LoadSet = base.load_set();
    let mut merge_ids = FidSet::new();

    for source_path in &cli.source {
        let mut source = Plugin::load_with_policy(source_path.clone(), &policy)
            .map_err(|e| anyhow::anyhow!("{}", e))
            .with_context(|| format!("无法加载源插件 {:?}", source_path))?;

        if cli.stats && !cli.quiet {
            println!("{}", source.get_stats().context("统计失败")?);
        }

        let before = merge_ids.len();
        base.merge_plugin(&mut source, &load_set, &mut merge_ids, cli.iim, cli.filter);
        if !cli.quiet {
            println!(
                "已合并 {:?}: 新增 {} 条记录进入merged-id集",
                source_path,
                merge_ids.len() - before
            );
        }
    }

    base.write_to_file(&cli.output)
        .with_context(|| format!("无法写入输出文件 {:?}", cli.output))?;

    if !cli.quiet {
        println!(
            "完成: {} 个源插件合并到 {:?} (共 {} 条merged-id)",
            cli.source.len(),
            cli.output,
            merge_ids.len()
        );
    }
    Ok(())
}
