use anyhow::Result;
use chrono::NaiveDate;

use permit_scrape::config::Config;
use permit_scrape::error::{AppError, ConfigError};
use permit_scrape::logger;
use permit_scrape::models::target::SearchCriteria;
use permit_scrape::orchestrator::App;
use permit_scrape::services::review_queue::{ResolutionTag, ReviewQueue};

const USAGE: &str = "\
用法:
  permit_scrape run --targets <dir> --concurrency <N> --mode single|bulk
                    [--address <查询地址>] [--date-range <起,止>]
  permit_scrape pending [--limit <N>]
  permit_scrape resolve <key> <tag> [备注…]

说明:
  run       批量抓取目标文件夹里的全部门户
            --mode single 需要 --address；--mode bulk 需要 --date-range（YYYY-MM-DD,YYYY-MM-DD）
  pending   列出待人工审核的队列条目（最旧在前）
  resolve   裁决一个条目，tag 可选: fixed | manual-fix | skip | permanent-block

环境变量可覆盖其余配置（TARGETS_DIR / LLM_API_KEY / USE_HEADLESS 等）。";

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match args.first() {
        Some(c) => c.as_str(),
        None => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    };

    match command {
        "run" => cmd_run(&args[1..]).await,
        "pending" => cmd_pending(&args[1..]).await,
        "resolve" => cmd_resolve(&args[1..]).await,
        "-h" | "--help" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => Err(invalid_arg("command", other, "可用命令: run | pending | resolve").into()),
    }
}

/// 批量抓取
async fn cmd_run(args: &[String]) -> Result<()> {
    let mut config = Config::from_env();
    let mut mode: Option<String> = None;
    let mut address: Option<String> = None;
    let mut date_range: Option<String> = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--targets" => config.targets_dir = take_value(&mut iter, "--targets")?,
            "--concurrency" => {
                let value = take_value(&mut iter, "--concurrency")?;
                let parsed: usize = value
                    .parse()
                    .map_err(|_| invalid_arg("--concurrency", &value, "应为正整数"))?;
                if parsed == 0 {
                    return Err(invalid_arg("--concurrency", &value, "并发数至少为 1").into());
                }
                config.max_concurrent_sessions = parsed;
            }
            "--mode" => mode = Some(take_value(&mut iter, "--mode")?),
            "--address" => address = Some(take_value(&mut iter, "--address")?),
            "--date-range" => date_range = Some(take_value(&mut iter, "--date-range")?),
            other => return Err(invalid_arg("run", other, "未知参数").into()),
        }
    }

    let criteria = build_criteria(mode.as_deref(), address, date_range)?;

    let app = App::initialize(config).await?;
    app.run(Some(&criteria)).await
}

/// 列出待审核条目
async fn cmd_pending(args: &[String]) -> Result<()> {
    let config = Config::from_env();
    let mut limit: Option<usize> = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--limit" => {
                let value = take_value(&mut iter, "--limit")?;
                limit = Some(
                    value
                        .parse()
                        .map_err(|_| invalid_arg("--limit", &value, "应为正整数"))?,
                );
            }
            other => return Err(invalid_arg("pending", other, "未知参数").into()),
        }
    }

    let queue = ReviewQueue::new(&config.review_queue_dir);
    let entries = queue.list_pending(limit).await?;

    if entries.is_empty() {
        println!("📭 审核队列为空");
        return Ok(());
    }

    println!("待审核条目 {} 个（最旧在前）:\n", entries.len());
    for entry in &entries {
        let outcome = match entry.context.outcome {
            Some(o) => format!("{:?}", o).to_lowercase(),
            None => "未收束".to_string(),
        };
        println!("  {}", entry.key);
        println!("    入队时间: {}", entry.enqueued_at);
        println!("    终态: {}  动作数: {}", outcome, entry.context.actions.len());
        println!("    原因: {}\n", entry.reason);
    }
    Ok(())
}

/// 裁决一个待审核条目
async fn cmd_resolve(args: &[String]) -> Result<()> {
    let config = Config::from_env();

    let key = args
        .first()
        .ok_or_else(|| missing_arg("key"))?;
    let tag: ResolutionTag = args
        .get(1)
        .ok_or_else(|| missing_arg("tag"))?
        .parse()?;
    let notes = args[2..].join(" ");

    let queue = ReviewQueue::new(&config.review_queue_dir);
    let entry = queue.resolve(key, tag, &notes).await?;

    println!("✅ 条目 {} 已裁决为 {}", entry.key, tag);
    if !notes.is_empty() {
        println!("   备注: {}", notes);
    }
    Ok(())
}

/// 由 --mode 决定需要哪种检索条件
fn build_criteria(
    mode: Option<&str>,
    address: Option<String>,
    date_range: Option<String>,
) -> Result<SearchCriteria, AppError> {
    match mode {
        None => Err(missing_arg("--mode")),
        Some("single") => {
            let query = address.ok_or_else(|| missing_arg("--address"))?;
            Ok(SearchCriteria::Address { query })
        }
        Some("bulk") => {
            let range = date_range.ok_or_else(|| missing_arg("--date-range"))?;
            let (start, end) = parse_date_range(&range)?;
            Ok(SearchCriteria::DateRange { start, end })
        }
        Some(other) => Err(invalid_arg("--mode", other, "可选值: single | bulk")),
    }
}

/// 解析 "YYYY-MM-DD,YYYY-MM-DD" 形式的日期范围
fn parse_date_range(raw: &str) -> Result<(NaiveDate, NaiveDate), AppError> {
    let mut parts = raw.splitn(2, ',');
    let (start_raw, end_raw) = match (parts.next(), parts.next()) {
        (Some(s), Some(e)) => (s.trim(), e.trim()),
        _ => return Err(invalid_arg("--date-range", raw, "格式应为 起,止")),
    };

    let start = NaiveDate::parse_from_str(start_raw, "%Y-%m-%d")
        .map_err(|_| invalid_arg("--date-range", start_raw, "日期格式应为 YYYY-MM-DD"))?;
    let end = NaiveDate::parse_from_str(end_raw, "%Y-%m-%d")
        .map_err(|_| invalid_arg("--date-range", end_raw, "日期格式应为 YYYY-MM-DD"))?;

    if start > end {
        return Err(invalid_arg("--date-range", raw, "起始日期晚于结束日期"));
    }
    Ok((start, end))
}

fn take_value(iter: &mut std::slice::Iter<'_, String>, name: &str) -> Result<String, AppError> {
    iter.next()
        .map(|s| s.to_string())
        .ok_or_else(|| missing_arg(name))
}

fn missing_arg(name: &str) -> AppError {
    AppError::Config(ConfigError::MissingArgument {
        name: name.to_string(),
    })
}

fn invalid_arg(name: &str, value: &str, reason: &str) -> AppError {
    AppError::Config(ConfigError::InvalidArgument {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date_range() {
        let (start, end) = parse_date_range("2026-01-01,2026-03-31").unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2026, 1, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2026, 3, 31).unwrap());

        assert!(parse_date_range("2026-03-31,2026-01-01").is_err());
        assert!(parse_date_range("2026-01-01").is_err());
        assert!(parse_date_range("not-a-date,2026-01-01").is_err());
    }

    #[test]
    fn test_build_criteria_by_mode() {
        let criteria = build_criteria(Some("single"), Some("100 N Main".to_string()), None).unwrap();
        assert!(matches!(criteria, SearchCriteria::Address { .. }));

        let criteria = build_criteria(
            Some("bulk"),
            None,
            Some("2026-01-01,2026-02-01".to_string()),
        )
        .unwrap();
        assert!(matches!(criteria, SearchCriteria::DateRange { .. }));

        assert!(build_criteria(None, None, None).is_err());
        assert!(build_criteria(Some("single"), None, None).is_err());
        assert!(build_criteria(Some("other"), None, None).is_err());
    }
}
