//! Markdown page generation with YAML front matter.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::article::SummarizedArticle;
use crate::error::{PipelineError, Result};

/// Category for articles no keyword matches
pub const DEFAULT_CATEGORY: &str = "Other Tech";

const CATEGORIES: &[(&str, &[&str])] = &[
    ("AI", &["人工智能", "ai", "机器学习", "深度学习", "神经网络", "machine learning", "gpt", "llm", "chatgpt", "openai", "anthropic", "claude"]),
    ("Mobile", &["苹果", "apple", "iphone", "ios", "android", "移动应用", "app store", "智能手机", "平板", "ipad"]),
    ("Autonomous Driving", &["自动驾驶", "特斯拉", "tesla", "robotaxi", "无人驾驶", "self-driving", "lyft", "uber"]),
    ("Cloud", &["云计算", "cloud", "aws", "azure", "google cloud", "微软", "microsoft", "云服务", "数据中心", "data center"]),
    ("Chips", &["芯片", "chip", "chips", "处理器", "processor", "nvidia", "intel", "amd", "gpu", "cpu", "半导体", "semiconductor", "quantum"]),
    ("Startups & Funding", &["创业", "投资", "融资", "vc", "startup", "funding", "独角兽", "unicorn"]),
    ("Cybersecurity", &["网络安全", "cybersecurity", "数据泄露", "data breach", "隐私", "privacy", "安全漏洞", "vulnerability"]),
    ("Blockchain", &["区块链", "blockchain", "加密货币", "比特币", "bitcoin", "以太坊", "ethereum", "crypto", "web3"]),
    ("Science", &["研究", "research", "科学", "science", "发现", "discovery", "突破", "breakthrough", "实验", "nature"]),
];

const MAX_TAGS: usize = 10;
const MAX_DESCRIPTION_CHARS: usize = 100;
const MAX_TAGS_PER_ARTICLE: usize = 5;

#[derive(Debug, Serialize)]
struct FrontMatter {
    title: String,
    #[serde(rename = "pubDate")]
    pub_date: String,
    description: String,
    tags: Vec<String>,
    layout: String,
}

/// Writes `{content_dir}/{date}/index.md`.
#[derive(Debug, Clone)]
pub struct MarkdownWriter {
    content_dir: PathBuf,
}

impl MarkdownWriter {
    pub fn new(content_dir: impl Into<PathBuf>) -> Self {
        Self {
            content_dir: content_dir.into(),
        }
    }

    pub fn output_path(&self, date: NaiveDate) -> PathBuf {
        self.content_dir
            .join(date.format("%Y-%m-%d").to_string())
            .join("index.md")
    }

    pub async fn write(&self, date: NaiveDate, articles: &[SummarizedArticle]) -> Result<PathBuf> {
        let page = render(date, articles)?;
        let path = self.output_path(date);
        write_atomic(&path, &page).await?;

        info!(
            "Markdown written to {} ({} articles, {} categories)",
            path.display(),
            articles.len(),
            group_by_category(articles).len()
        );
        Ok(path)
    }
}

/// Full page: front matter followed by one section per category.
pub fn render(date: NaiveDate, articles: &[SummarizedArticle]) -> Result<String> {
    if articles.is_empty() {
        return Err(PipelineError::EmptyBatch(format!(
            "no summarized articles to write for {}",
            date
        )));
    }

    let front = front_matter(date, articles)?;
    let mut page = format!("---\n{}---\n\n", front);

    for (category, items) in group_by_category(articles) {
        page.push_str(&format!("## {}\n\n", category));
        for item in items {
            let article = &item.selected.article;
            page.push_str(&format!("- **{}**\n", article.title));
            page.push_str(&format!("  {}\n", item.summary));
            if !item.bullets.is_empty() {
                let tags: Vec<&str> = item
                    .bullets
                    .iter()
                    .take(MAX_TAGS_PER_ARTICLE)
                    .map(String::as_str)
                    .collect();
                page.push_str(&format!("  *Tags: {}*\n", tags.join(" · ")));
            }
            page.push_str(&format!("  [Read more]({}) | Source: {}\n\n", article.url, article.source));
        }
    }

    Ok(page)
}

fn front_matter(date: NaiveDate, articles: &[SummarizedArticle]) -> Result<String> {
    let day = date.format("%Y-%m-%d").to_string();
    let first_summary = articles.first().map(|a| a.summary.as_str()).unwrap_or_default();

    let mut description: String = first_summary.chars().take(MAX_DESCRIPTION_CHARS).collect();
    if first_summary.chars().count() > MAX_DESCRIPTION_CHARS {
        description.push_str("...");
    }

    let unique: BTreeSet<&str> = articles
        .iter()
        .flat_map(|a| a.bullets.iter().map(String::as_str))
        .collect();
    let mut tags = vec!["News".to_string(), "Daily".to_string()];
    tags.extend(unique.into_iter().take(MAX_TAGS).map(str::to_string));

    let front = FrontMatter {
        title: format!("Daily News Brief · {}", day),
        pub_date: day,
        description,
        tags,
        layout: "news".to_string(),
    };
    serde_yaml::to_string(&front)
        .map_err(|e| PipelineError::artifact("index.md", format!("front matter: {}", e)))
}

/// Category with the most keyword hits; ties go to the earlier category.
pub fn categorize(article: &SummarizedArticle) -> &'static str {
    let text = format!(
        "{} {} {}",
        article.selected.article.title,
        article.summary,
        article.bullets.join(" ")
    )
    .to_lowercase();
    let padded = format!(
        " {} ",
        text.split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    );

    let mut best = (DEFAULT_CATEGORY, 0);
    for (category, keywords) in CATEGORIES {
        let score = keywords.iter().filter(|k| keyword_hit(&text, &padded, k)).count();
        if score > best.1 {
            best = (*category, score);
        }
    }
    best.0
}

// ASCII keywords must match whole words; others (CJK) match as substrings.
fn keyword_hit(text: &str, padded_words: &str, keyword: &str) -> bool {
    if keyword.is_ascii() {
        let words = keyword
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        padded_words.contains(&format!(" {} ", words))
    } else {
        text.contains(keyword)
    }
}

/// Categories in order of first appearance, articles in input order.
fn group_by_category(articles: &[SummarizedArticle]) -> Vec<(&'static str, Vec<&SummarizedArticle>)> {
    let mut groups: Vec<(&'static str, Vec<&SummarizedArticle>)> = Vec::new();
    for article in articles {
        let category = categorize(article);
        match groups.iter_mut().find(|(c, _)| *c == category) {
            Some((_, items)) => items.push(article),
            None => groups.push((category, vec![article])),
        }
    }
    groups
}

async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PipelineError::artifact(parent, e))?;
    }
    let tmp = path.with_extension("md.tmp");
    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| PipelineError::artifact(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| PipelineError::artifact(path, e))
}
