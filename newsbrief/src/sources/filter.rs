//! Keyword relevance filter for technology and science news.

const TECH_KEYWORDS: &[&str] = &[
    "artificial intelligence", "ai", "machine learning", "deep learning", "neural network",
    "gpt", "llm", "large language model", "chatgpt", "openai", "anthropic", "claude",
    "algorithm", "programming", "software", "technology", "tech", "startup",
    "robotics", "automation", "computer science", "data science", "quantum computing",
    "blockchain", "cryptocurrency", "cybersecurity", "cloud computing", "api",
    "semiconductor", "chip", "chips", "processor", "microprocessor", "gpu", "cpu",
    "app", "platform", "google", "microsoft", "apple", "meta", "tesla", "intel",
    "nvidia", "coding", "developer", "github", "open source", "database",
    "web development", "mobile app", "ios", "android", "linux", "windows",
];

const SCIENCE_KEYWORDS: &[&str] = &[
    "research", "study", "discovery", "breakthrough", "innovation", "scientific",
    "experiment", "development", "advancement", "progress", "engineering",
    "crispr", "genetics", "space", "nasa", "spacex", "climate", "energy",
    "battery", "renewable", "electric vehicle", "ev", "autonomous",
];

const EXCLUDE_KEYWORDS: &[&str] = &[
    "sports", "entertainment", "celebrity", "fashion", "politics", "election",
    "weather", "crime", "accident", "death", "murder", "war", "military",
    "porn", "adult", "sex", "dating", "relationship", "love", "marriage",
];

/// Tech keywords score 2, science keywords 1; any excluded keyword rejects the text.
pub fn relevance_score(title: &str, description: &str) -> Option<u32> {
    let text = format!(" {} ", normalize(&format!("{} {}", title, description)));

    if EXCLUDE_KEYWORDS.iter().any(|k| contains_phrase(&text, k)) {
        return None;
    }

    let tech = TECH_KEYWORDS.iter().filter(|k| contains_phrase(&text, k)).count() as u32;
    let science = SCIENCE_KEYWORDS.iter().filter(|k| contains_phrase(&text, k)).count() as u32;
    Some(tech * 2 + science)
}

pub fn is_relevant(title: &str, description: &str) -> bool {
    relevance_score(title, description).map_or(false, |score| score >= 1)
}

// Lowercase, with every non-alphanumeric run collapsed to one space.
fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn contains_phrase(padded_text: &str, keyword: &str) -> bool {
    padded_text.contains(&format!(" {} ", keyword))
}
