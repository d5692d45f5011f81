use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub env: String,
    pub node_name: String,
    pub host: String,
    pub http_port: u16,
    pub registry_path: Option<String>,
    pub remote_timeout: Duration,
    pub load_workers: usize,
    pub finetuned_models: Vec<String>,
    pub api_token: Option<String>,
    pub log_format: String,
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl AppConfig {
    pub fn load() -> Self {
        let ft_raw = env::var("FINETUNED_MODELS").unwrap_or_default();

        Self {
            env: env::var("ENV").unwrap_or_else(|_| "production".into()),
            node_name: env::var("NODE_NAME").unwrap_or_else(|_|
                hostname::get().map(|h| h.to_string_lossy().into_owned()).unwrap_or("FLEET-NODE".into())
            ).to_uppercase(),
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            http_port: env::var("HTTP_PORT").unwrap_or("7860".to_string()).parse().unwrap_or(7860),
            registry_path: non_empty("REGISTRY_PATH"),
            remote_timeout: Duration::from_secs(
                env::var("REMOTE_TIMEOUT_SECS").unwrap_or("30".to_string()).parse().unwrap_or(30)
            ),
            load_workers: env::var("LOAD_WORKERS").unwrap_or("3".to_string()).parse().ok()
                .filter(|n: &usize| *n > 0)
                .unwrap_or(3),
            finetuned_models: split_list(&ft_raw),
            api_token: non_empty("API_TOKEN"),
            log_format: env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_parsing_drops_blanks() {
        assert_eq!(split_list(" a, ,b ,,c"), vec!["a", "b", "c"]);
        assert!(split_list("").is_empty());
    }
}
