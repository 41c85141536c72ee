//! First-run installation of artifacts shipped inside the package

use std::path::Path;

use tracing::{error, info, warn};

use super::dashboard::BUILTIN_DASHBOARDS;
use super::install;
use super::settings::Paths;
use crate::error::{Error, Result};
use crate::platform::{self, Owner};

/// Geo databases the core reads from its resource directory
pub const GEO_FILES: &[&str] = &["country.mmdb", "geosite.dat", "asn.mmdb"];

/// Compressed core shipped in `bin/`
const BUNDLED_CORE: &str = "mihomo.gz";

/// Unpack whatever the package shipped in `bin/`.
///
/// The core and geo files are required to succeed; dashboards are best effort.
pub fn install_bundled(paths: &Paths, owner: Owner) -> Result<()> {
    let bin_dir = paths.bin_dir();

    let bundled_core = bin_dir.join(BUNDLED_CORE);
    if bundled_core.exists() {
        info!("Installing bundled core");
        install::install_gzip(&bundled_core, &paths.core_path(), owner)?;
    }

    for name in GEO_FILES {
        let source = bin_dir.join(name);
        if source.exists() {
            let target = paths.runtime_dir.join(name);
            info!("Installing bundled {}", name);
            install::move_file(&source, &target)?;
            if let Err(e) = platform::set_owner(&target, owner) {
                warn!("Failed to chown {:?}: {}", target, e);
            }
        }
    }

    for (name, _) in BUILTIN_DASHBOARDS {
        let archive = bin_dir.join(format!("{}.zip", name));
        if !archive.exists() {
            continue;
        }
        match install_dashboard(&archive, &paths.dashboard_dir(), name, owner) {
            Ok(()) => info!("Installed bundled dashboard {}", name),
            Err(e) => error!("Failed to install dashboard {}: {}", name, e),
        }
    }
    Ok(())
}

/// Replace `dashboard_dir/<name>` with the archive's top-level directory
fn install_dashboard(archive: &Path, dashboard_dir: &Path, name: &str, owner: Owner) -> Result<()> {
    let staging = dashboard_dir.join(format!(".{}.staging", name));
    if staging.exists() {
        std::fs::remove_dir_all(&staging)
            .map_err(|e| Error::fs("failed to clear dashboard staging", e))?;
    }
    std::fs::create_dir_all(&staging)
        .map_err(|e| Error::fs("failed to create dashboard staging", e))?;

    let result = (|| {
        install::unzip(archive, &staging)?;
        let root = install::extracted_root(&staging, name)
            .map_err(|e| Error::fs("failed to inspect dashboard archive", e))?;
        let target = dashboard_dir.join(name);
        if target.exists() {
            std::fs::remove_dir_all(&target)
                .map_err(|e| Error::fs("failed to remove old dashboard", e))?;
        }
        std::fs::rename(&root, &target)
            .map_err(|e| Error::fs("failed to move dashboard into place", e))?;
        platform::set_tree_owner(&target, owner)
            .map_err(|e| Error::fs("failed to set dashboard owner", e))
    })();

    if staging.exists() {
        let _ = std::fs::remove_dir_all(&staging);
    }
    result?;

    if let Err(e) = std::fs::remove_file(archive) {
        warn!("Failed to remove {:?}: {}", archive, e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let mut zip = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
        let options = zip::write::FileOptions::default();
        for (name, body) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(body).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_install_bundled_geo_and_dashboard() {
        let root = tempfile::tempdir().unwrap();
        let paths = Paths::under(root.path());
        paths.ensure().unwrap();

        std::fs::write(paths.bin_dir().join("geosite.dat"), b"geo").unwrap();
        write_zip(
            &paths.bin_dir().join("metacubexd.zip"),
            &[("metacubexd-gh-pages/index.html", b"<html>".as_slice())],
        );

        install_bundled(&paths, Owner::current()).unwrap();

        assert!(paths.runtime_dir.join("geosite.dat").exists());
        assert!(!paths.bin_dir().join("geosite.dat").exists());
        assert!(paths
            .dashboard_dir()
            .join("metacubexd")
            .join("index.html")
            .exists());
        assert!(!paths.bin_dir().join("metacubexd.zip").exists());
    }

    #[test]
    fn test_broken_dashboard_is_not_fatal() {
        let root = tempfile::tempdir().unwrap();
        let paths = Paths::under(root.path());
        paths.ensure().unwrap();
        std::fs::write(paths.bin_dir().join("zashboard.zip"), b"not a zip").unwrap();

        install_bundled(&paths, Owner::current()).unwrap();

        assert!(!paths.dashboard_dir().join("zashboard").exists());
        assert!(!paths.dashboard_dir().join(".zashboard.staging").exists());
    }

    #[test]
    fn test_nothing_bundled() {
        let root = tempfile::tempdir().unwrap();
        let paths = Paths::under(root.path());
        paths.ensure().unwrap();
        install_bundled(&paths, Owner::current()).unwrap();
        assert!(!paths.core_path().exists());
    }
}
