//! Index selector grammar shared by every component
//! 所有组件共享的索引选择语法
//!
//! A selector is either the literal `all` or a comma separated list of
//! terms, each term being `N` or `A-B` (inclusive). `5-2` is valid and
//! selects nothing. Parsing is all-or-nothing.
//! 选择器是 `all` 或逗号分隔的 `N` / `A-B` 项列表，解析要么全部成功要么失败。

use thiserror::Error;

use crate::constants::command::SELECT_ALL;

/// Selector syntax error carrying the offending term / 携带出错项的选择器语法错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid selector term `{term}`")]
pub struct RangeSpecError {
    pub term: String,
}

/// Parsed membership set of sub-resource indices / 已解析的子资源索引集合
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSpec {
    // Inclusive, non-empty bounds. Degenerate ranges are dropped at parse time.
    bounds: Vec<(usize, usize)>,
}

impl RangeSpec {
    /// Parse `0,2-4,7` style text / 解析 `0,2-4,7` 形式的文本
    pub fn parse(text: &str) -> Result<Self, RangeSpecError> {
        let mut bounds = Vec::new();
        for term in text.split(',') {
            match term.split_once('-') {
                Some((low, high)) if is_digits(low) && is_digits(high) => {
                    let low = parse_index(low, term)?;
                    let high = parse_index(high, term)?;
                    if low <= high {
                        bounds.push((low, high));
                    }
                }
                _ if is_digits(term) => {
                    let n = parse_index(term, term)?;
                    bounds.push((n, n));
                }
                _ => {
                    return Err(RangeSpecError {
                        term: term.to_string(),
                    })
                }
            }
        }
        Ok(Self { bounds })
    }

    pub fn contains(&self, index: usize) -> bool {
        self.bounds
            .iter()
            .any(|&(low, high)| low <= index && index <= high)
    }

    /// Largest selected index, `None` when nothing is selected
    /// 选中的最大索引，未选中任何索引时为 `None`
    pub fn max_index(&self) -> Option<usize> {
        self.bounds.iter().map(|&(_, high)| high).max()
    }

    pub fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn parse_index(digits: &str, term: &str) -> Result<usize, RangeSpecError> {
    digits.parse::<usize>().map_err(|_| RangeSpecError {
        term: term.to_string(),
    })
}

/// Target of a control operation / 控制操作的目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    All,
    Subset(RangeSpec),
}

/// Selector names an index the component does not have
/// 选择器包含组件不存在的索引
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("index {index} out of range (have {count})")]
pub struct OutOfRange {
    pub index: usize,
    pub count: usize,
}

impl Selector {
    pub fn parse(token: &str) -> Result<Self, RangeSpecError> {
        if token == SELECT_ALL {
            Ok(Selector::All)
        } else {
            RangeSpec::parse(token).map(Selector::Subset)
        }
    }

    /// Resolve against `count` known sub-resources, ascending and deduplicated.
    /// 针对已知的 `count` 个子资源求值，结果升序且去重。
    pub fn resolve(&self, count: usize) -> Result<Vec<usize>, OutOfRange> {
        match self {
            Selector::All => Ok((0..count).collect()),
            Selector::Subset(spec) => {
                if let Some(index) = spec.max_index().filter(|&max| max >= count) {
                    return Err(OutOfRange { index, count });
                }
                Ok((0..count).filter(|&i| spec.contains(i)).collect())
            }
        }
    }
}
