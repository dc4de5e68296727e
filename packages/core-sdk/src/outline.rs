use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{Page, PageType};

static PAGE_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<page>").expect("valid page token regex"));

static NUMBERED_PAGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"【第\s*\d+\s*页】").expect("valid numbered page regex"));

static TITLE_NUMBERING_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\s*").expect("valid numbering regex"));

const COVER_KEYWORDS: [&str; 4] = ["封面", "标题", "cover", "title"];
const SUMMARY_KEYWORDS: [&str; 4] = ["总结", "结语", "summary", "conclusion"];

const MAX_TITLES: usize = 5;
const MAX_TAGS: usize = 15;

/**
 * \brief 把大纲文本切分为页面。
 * \details 以 `<page>` 分隔（大小写不敏感）；文本中没有该标记时退回 `【第N页】` 编号分隔。
 *          首段为封面，末段为总结，其余为内容页；关键字只能改写中间段的类型。
 */
pub fn parse_outline(raw: &str) -> Vec<Page> {
    let splitter: &Regex = if PAGE_TOKEN_RE.is_match(raw) || !NUMBERED_PAGE_RE.is_match(raw) {
        &PAGE_TOKEN_RE
    } else {
        &NUMBERED_PAGE_RE
    };

    let segments: Vec<&str> = splitter
        .split(raw)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let last = segments.len().saturating_sub(1);
    segments
        .iter()
        .enumerate()
        .map(|(i, content)| Page {
            index: i as u32,
            page_type: classify(i, last, content),
            content: content.to_string(),
        })
        .collect()
}

fn classify(index: usize, last: usize, content: &str) -> PageType {
    if index == 0 {
        return PageType::Cover;
    }
    if index == last {
        return PageType::Summary;
    }
    let lower = content.to_lowercase();
    if COVER_KEYWORDS.iter().any(|k| lower.contains(k)) {
        PageType::Cover
    } else if SUMMARY_KEYWORDS.iter().any(|k| lower.contains(k)) {
        PageType::Summary
    } else {
        PageType::Content
    }
}

/**
 * \brief 每行一个标题，去掉 `1.` 之类的编号，最多 5 个。
 */
pub fn parse_titles(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| TITLE_NUMBERING_RE.replace(l, "").trim().to_string())
        .filter(|l| !l.is_empty())
        .take(MAX_TITLES)
        .collect()
}

pub fn parse_tags(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .take(MAX_TAGS)
        .collect()
}
