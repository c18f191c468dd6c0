/// Tests for building layers from directories on disk
#[cfg(test)]
mod layer_build_tests {
    use flate2::read::GzDecoder;
    use layerstack::config::{LayerAttributes, LocalDirConfig};
    use layerstack::error::LayerstackError;
    use layerstack::layer::{Layer, LayerBuilder, LocalDir};
    use layerstack::logging::{BuildEvent, BuildObserver, NoopObserver};
    use parking_lot::Mutex;
    use std::fs;
    use std::io::Read;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recording(Mutex<Vec<BuildEvent>>);

    impl BuildObserver for Recording {
        fn on_event(&self, event: BuildEvent) {
            self.0.lock().push(event);
        }
    }

    fn builder() -> LayerBuilder {
        LayerBuilder::new(Arc::new(NoopObserver))
    }

    fn dir_config(path: &Path) -> LocalDirConfig {
        LocalDirConfig {
            path: path.display().to_string(),
            ..Default::default()
        }
    }

    fn entries(layer: &Layer) -> Vec<(String, u32, Vec<u8>)> {
        let mut archive = tar::Archive::new(GzDecoder::new(layer.blob()));
        let mut out = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = entry.path().unwrap().display().to_string();
            let mode = entry.header().mode().unwrap();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            out.push((path, mode, content));
        }
        out
    }

    fn names(layer: &Layer) -> Vec<String> {
        entries(layer).into_iter().map(|(p, _, _)| p).collect()
    }

    #[test]
    fn test_identical_trees_give_identical_digests() {
        let first = tempdir().unwrap();
        fs::create_dir_all(first.path().join("sub")).unwrap();
        fs::write(first.path().join("a.txt"), b"alpha").unwrap();
        fs::write(first.path().join("b.txt"), b"beta").unwrap();
        fs::write(first.path().join("sub/c.txt"), b"gamma").unwrap();

        // same content, written in the opposite order and later
        let second = tempdir().unwrap();
        fs::create_dir_all(second.path().join("sub")).unwrap();
        fs::write(second.path().join("sub/c.txt"), b"gamma").unwrap();
        fs::write(second.path().join("b.txt"), b"beta").unwrap();
        fs::write(second.path().join("a.txt"), b"alpha").unwrap();

        let attrs = LayerAttributes::default();
        let a = builder().from_dir(&LocalDir::new(first.path()), &attrs).unwrap();
        let b = builder().from_dir(&LocalDir::new(second.path()), &attrs).unwrap();

        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.diff_id(), b.diff_id());
        assert_eq!(names(&a), vec!["a.txt", "b.txt", "sub/c.txt"]);
    }

    #[test]
    fn test_ignored_files_never_appear() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("logs")).unwrap();
        fs::write(dir.path().join("app.txt"), b"app").unwrap();
        fs::write(dir.path().join("debug.log"), b"noise").unwrap();
        fs::write(dir.path().join("keep.log"), b"kept").unwrap();
        fs::write(dir.path().join("logs/old.txt"), b"old").unwrap();

        let mut config = dir_config(dir.path());
        config.container_path = Some("/srv".to_string());
        config.ignore = vec!["*.log".to_string(), "!keep.log".to_string(), "logs".to_string()];
        let layer = builder()
            .from_dir(&LocalDir::from_config(&config).unwrap(), &LayerAttributes::default())
            .unwrap();

        assert_eq!(names(&layer), vec!["srv/app.txt", "srv/keep.log"]);
    }

    #[test]
    fn test_fully_ignored_source_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.tmp"), b"x").unwrap();
        let mut config = dir_config(dir.path());
        config.ignore = vec!["*.tmp".to_string()];

        let err = builder()
            .from_dir(&LocalDir::from_config(&config).unwrap(), &LayerAttributes::default())
            .unwrap_err();
        assert!(matches!(err, LayerstackError::EmptyLayer { .. }));
        assert!(err.to_string().contains("empty layer"));
    }

    #[test]
    fn test_max_files_exceeded() {
        let dir = tempdir().unwrap();
        for i in 0..3 {
            fs::write(dir.path().join(format!("f{}", i)), b"x").unwrap();
        }
        let mut config = dir_config(dir.path());
        config.max_files = Some(2);

        let err = builder()
            .from_dir(&LocalDir::from_config(&config).unwrap(), &LayerAttributes::default())
            .unwrap_err();
        assert!(matches!(
            err,
            LayerstackError::LimitExceeded {
                what: "number of files",
                limit: 2,
                ..
            }
        ));
    }

    #[test]
    fn test_max_size_exceeded() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("big"), vec![0u8; 64]).unwrap();
        let mut config = dir_config(dir.path());
        config.max_size = Some("63".to_string());

        let err = builder()
            .from_dir(&LocalDir::from_config(&config).unwrap(), &LayerAttributes::default())
            .unwrap_err();
        assert!(matches!(
            err,
            LayerstackError::LimitExceeded {
                actual: 64,
                limit: 63,
                ..
            }
        ));
    }

    #[test]
    fn test_limits_at_boundary_pass() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), vec![1u8; 32]).unwrap();
        fs::write(dir.path().join("b"), vec![2u8; 32]).unwrap();
        let mut config = dir_config(dir.path());
        config.max_files = Some(2);
        config.max_size = Some("64".to_string());

        let layer = builder()
            .from_dir(&LocalDir::from_config(&config).unwrap(), &LayerAttributes::default())
            .unwrap();
        assert_eq!(names(&layer).len(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_mode_policies() {
        use layerstack::config::FileModePolicy;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let script = dir.path().join("run.sh");
        fs::write(&script, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o750)).unwrap();
        let local = LocalDir::new(dir.path());

        let normalized = builder().from_dir(&local, &LayerAttributes::default()).unwrap();
        assert_eq!(entries(&normalized)[0].1, 0o755);

        let preserve = LayerAttributes {
            mode_policy: FileModePolicy::Preserve,
            ..Default::default()
        };
        let preserved = builder().from_dir(&local, &preserve).unwrap();
        assert_eq!(entries(&preserved)[0].1, 0o750);

        let explicit = LayerAttributes {
            file_mode: Some(0o600),
            mode_policy: FileModePolicy::Preserve,
            ..Default::default()
        };
        let forced = builder().from_dir(&local, &explicit).unwrap();
        assert_eq!(entries(&forced)[0].1, 0o600);
    }

    #[test]
    fn test_ownership_from_attributes() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), b"a").unwrap();
        let attrs = LayerAttributes {
            uid: Some(65532),
            gid: Some(65533),
            ..Default::default()
        };
        let layer = builder().from_dir(&LocalDir::new(dir.path()), &attrs).unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(layer.blob()));
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.header().uid().unwrap(), 65532);
        assert_eq!(entry.header().gid().unwrap(), 65533);
        assert_eq!(entry.header().mtime().unwrap(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_relative_symlinks_are_kept() {
        use std::os::unix::fs::symlink;

        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib/app"), b"binary").unwrap();
        fs::create_dir_all(dir.path().join("bin")).unwrap();
        symlink("../lib/app", dir.path().join("bin/app")).unwrap();
        symlink("/etc/hostname", dir.path().join("outside")).unwrap();

        let observer = Arc::new(Recording::default());
        let layer = LayerBuilder::new(observer.clone())
            .from_dir(&LocalDir::new(dir.path()), &LayerAttributes::default())
            .unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(layer.blob()));
        let found: Vec<(String, tar::EntryType, Option<String>)> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                let link = e.link_name().unwrap().map(|l| l.display().to_string());
                (e.path().unwrap().display().to_string(), e.header().entry_type(), link)
            })
            .collect();
        assert_eq!(
            found,
            vec![
                ("bin/app".to_string(), tar::EntryType::Symlink, Some("../lib/app".to_string())),
                ("lib/app".to_string(), tar::EntryType::Regular, None),
            ]
        );

        let events = observer.0.lock();
        assert!(events.iter().any(|e| matches!(
            e,
            BuildEvent::Warning { message } if message.contains("outside")
        )));
    }
}
