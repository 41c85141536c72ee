//! Web dashboards served by the core's external controller

use std::path::Path;

use tracing::error;

/// Dashboards the core knows how to fetch, with their archive URLs
pub const BUILTIN_DASHBOARDS: &[(&str, &str)] = &[
    (
        "yacd-meta",
        "https://github.com/MetaCubeX/yacd/archive/gh-pages.zip",
    ),
    (
        "metacubexd",
        "https://github.com/MetaCubeX/metacubexd/archive/refs/heads/gh-pages.zip",
    ),
    (
        "zashboard",
        "https://github.com/Zephyruso/zashboard/releases/latest/download/dist.zip",
    ),
];

/// Fetch URL of a built-in dashboard
pub fn builtin_url(name: &str) -> Option<&'static str> {
    BUILTIN_DASHBOARDS
        .iter()
        .find(|(builtin, _)| *builtin == name)
        .map(|(_, url)| *url)
}

/// Names of installed dashboards: subdirectories holding an `index.html`
pub fn list_dashboards(dashboard_dir: &Path) -> Vec<String> {
    let entries = match std::fs::read_dir(dashboard_dir) {
        Ok(entries) => entries,
        Err(e) => {
            error!("Dashboard directory {:?} unreadable: {}", dashboard_dir, e);
            return Vec::new();
        }
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && path.join("index.html").exists())
        .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_url() {
        assert!(builtin_url("zashboard").unwrap().ends_with("dist.zip"));
        assert_eq!(builtin_url("custom"), None);
    }

    #[test]
    fn test_list_dashboards_requires_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("metacubexd")).unwrap();
        std::fs::write(dir.path().join("metacubexd/index.html"), "<html>").unwrap();
        std::fs::create_dir_all(dir.path().join("broken")).unwrap();
        std::fs::write(dir.path().join("stray.txt"), "x").unwrap();

        assert_eq!(list_dashboards(dir.path()), vec!["metacubexd".to_string()]);
    }

    #[test]
    fn test_list_dashboards_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(list_dashboards(&dir.path().join("absent")).is_empty());
    }
}
