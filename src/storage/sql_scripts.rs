/*!
 * SQL脚本加载器模块
 *
 * 表结构脚本在编译期嵌入（`sql/` 目录），运行时解析为独立语句按顺序执行。
 * 支持注释过滤、语句分割以及 CREATE TRIGGER ... END; 块。
 */

use crate::app_bail;
use crate::utils::error::AppResult;
use anyhow::Context;
use tracing::debug;

/// 嵌入的脚本：(文件名, 内容)
const EMBEDDED_SCRIPTS: &[(&str, &str)] = &[(
    "01_checkpoint_tables",
    include_str!("../../sql/01_checkpoint_tables.sql"),
)];

#[derive(Debug, Clone)]
pub struct SqlScript {
    pub name: String,
    pub order: u32,
    pub statements: Vec<String>,
}

pub struct SqlScriptCatalog;

impl SqlScriptCatalog {
    /// 加载全部嵌入脚本，按执行顺序排序
    pub fn load() -> AppResult<Vec<SqlScript>> {
        let mut scripts = Vec::with_capacity(EMBEDDED_SCRIPTS.len());

        for (name, content) in EMBEDDED_SCRIPTS {
            let order = parse_order_from_filename(name)
                .with_context(|| format!("解析SQL脚本顺序失败: {}", name))?;
            let statements = parse_sql_statements(content);
            debug!("Loaded SQL script {} ({} statements)", name, statements.len());
            scripts.push(SqlScript {
                name: (*name).to_string(),
                order,
                statements,
            });
        }

        scripts.sort_by_key(|s| s.order);
        Ok(scripts)
    }
}

/// 从文件名解析执行顺序（格式为 01_tables 或 01-tables）
fn parse_order_from_filename(filename: &str) -> AppResult<u32> {
    let digits: String = filename.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        app_bail!("执行顺序解析失败: {}", filename);
    }
    digits
        .parse::<u32>()
        .with_context(|| format!("执行顺序解析失败: {}", filename))
}

fn parse_sql_statements(content: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current_statement = String::new();
    let mut in_multiline_comment = false;
    let mut in_trigger_block = false;

    for line in content.lines() {
        let trimmed = line.trim();

        if trimmed.is_empty() {
            continue;
        }

        // 多行注释
        if in_multiline_comment {
            if trimmed.ends_with("*/") {
                in_multiline_comment = false;
            }
            continue;
        }
        if trimmed.starts_with("/*") {
            if !trimmed.ends_with("*/") {
                in_multiline_comment = true;
            }
            continue;
        }

        if trimmed.starts_with("--") {
            continue;
        }

        if !in_trigger_block {
            let upper = trimmed.to_uppercase();
            if upper.starts_with("CREATE TRIGGER") || upper.starts_with("CREATE TEMP TRIGGER") {
                in_trigger_block = true;
            }
        }

        if !current_statement.is_empty() {
            current_statement.push(' ');
        }
        current_statement.push_str(trimmed);

        // 触发器块内仅在 END; 处结束语句
        if in_trigger_block {
            if trimmed.to_uppercase().ends_with("END;") {
                push_statement(&mut statements, &mut current_statement);
                in_trigger_block = false;
            }
            continue;
        }

        if trimmed.ends_with(';') {
            push_statement(&mut statements, &mut current_statement);
        }
    }

    let final_statement = current_statement.trim();
    if !final_statement.is_empty() {
        statements.push(final_statement.to_string());
    }

    statements
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    if current.ends_with(';') {
        current.pop();
    }
    let statement = current.trim().to_string();
    if !statement.is_empty() {
        statements.push(statement);
    }
    current.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_statement_parsing() {
        let content = r#"
            -- 这是注释
            CREATE TABLE test (
                id INTEGER PRIMARY KEY
            );

            /* 多行注释
               继续注释 */
            INSERT INTO test VALUES (1);

            CREATE TRIGGER trg AFTER INSERT ON test
            BEGIN
                UPDATE test SET id = id;
            END;

            SELECT * FROM test
        "#;

        let statements = parse_sql_statements(content);
        assert_eq!(statements.len(), 4);
        assert!(statements[0].starts_with("CREATE TABLE test"));
        assert!(statements[1].starts_with("INSERT INTO test"));
        assert!(statements[2].contains("UPDATE test SET id = id;"));
        assert!(statements[2].ends_with("END"));
        assert_eq!(statements[3], "SELECT * FROM test");
    }

    #[test]
    fn test_order_parsing() {
        assert_eq!(parse_order_from_filename("01_tables").unwrap(), 1);
        assert_eq!(parse_order_from_filename("42-indexes").unwrap(), 42);
        assert!(parse_order_from_filename("tables").is_err());
    }

    #[test]
    fn embedded_schema_covers_all_tables() {
        let scripts = SqlScriptCatalog::load().unwrap();
        let all = scripts
            .iter()
            .flat_map(|s| s.statements.iter())
            .cloned()
            .collect::<Vec<_>>()
            .join("\n");

        for table in [
            "checkpoint_sessions",
            "checkpoints",
            "checkpoint_file_snapshots",
            "checkpoint_blobs",
        ] {
            assert!(
                all.contains(&format!("CREATE TABLE IF NOT EXISTS {} (", table)),
                "missing table {}",
                table
            );
        }
    }
}
