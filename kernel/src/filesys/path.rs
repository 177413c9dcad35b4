//! Hierarchical path resolution over the directory layer. Paths are
//! slash-delimited, absolute when they start with `/`, otherwise relative
//! to the caller's working directory. A trailing slash names a directory
//! with an empty last component.

use super::Filesys;
use super::dir::Dir;

/// Splits `path` into (parent directory path, last component), so callers
/// can open the parent first. Rejoining the two with `/` reproduces the
/// path, modulo a trailing slash.
pub fn extract_name(path: &str) -> (&str, &str) {
    if let Some(stripped) = path.strip_suffix('/') {
        // Directory reference: the whole path is the parent, the last
        // component is empty.
        let parent = if stripped.is_empty() { "/" } else { stripped };
        return (parent, "");
    }

    match path.rfind('/') {
        None => ("", path),
        Some(0) => ("/", &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
    }
}

/// Walks `path` from the root or from `cwd` and returns an open handle on
/// the directory it names. Fails if any component is missing, is a regular
/// file, or if the destination has been removed.
pub fn open_path(fs: &Filesys, cwd: Option<&Dir>, path: &str) -> Option<Dir> {
    let (mut cur, rest) = if let Some(rest) = path.strip_prefix('/') {
        (fs.root_dir(), rest)
    } else {
        let cur = match cwd {
            Some(dir) => dir.reopen(),
            None => fs.root_dir(),
        };
        (cur, path)
    };

    for component in rest.split('/').filter(|c| !c.is_empty()) {
        let inode = cur.lookup(component)?;
        cur = Dir::open(inode)?;
    }

    if cur.inode().is_removed() {
        return None;
    }
    Some(cur)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_plain_names() {
        assert_eq!(extract_name("file"), ("", "file"));
        assert_eq!(extract_name("/file"), ("/", "file"));
        assert_eq!(extract_name("a/b/c"), ("a/b", "c"));
        assert_eq!(extract_name("/a/b/c"), ("/a/b", "c"));
    }

    #[test]
    fn split_trailing_slash_is_a_directory() {
        assert_eq!(extract_name("a/b/"), ("a/b", ""));
        assert_eq!(extract_name("/"), ("/", ""));
    }

    #[test]
    fn split_rejoins_to_the_original() {
        for path in ["a", "/a", "a/b", "/a/b/c", "x/y/z"] {
            let (parent, last) = extract_name(path);
            let rejoined = if parent.is_empty() {
                last.to_owned()
            } else if parent == "/" {
                format!("/{last}")
            } else {
                format!("{parent}/{last}")
            };
            assert_eq!(rejoined, path);
        }
    }

    #[test]
    fn walks_absolute_and_relative() {
        let fs = Filesys::format();
        fs.mkdir(None, "/a").unwrap();
        fs.mkdir(None, "/a/b").unwrap();

        let b = open_path(&fs, None, "/a/b").unwrap();
        assert!(open_path(&fs, Some(&b), "../b").is_some());
        assert!(open_path(&fs, Some(&b), ".").is_some());
        assert_eq!(
            open_path(&fs, Some(&b), "..").unwrap().inode().number(),
            open_path(&fs, None, "/a").unwrap().inode().number()
        );
        assert!(open_path(&fs, None, "/a/missing").is_none());
    }

    #[test]
    fn files_are_not_directories() {
        let fs = Filesys::format();
        fs.mkdir(None, "d").unwrap();
        fs.create(None, "d/f", 10).unwrap();
        assert!(open_path(&fs, None, "d/f").is_none());
        assert!(open_path(&fs, None, "d/f/g").is_none());
    }

    #[test]
    fn empty_path_is_the_working_directory() {
        let fs = Filesys::format();
        fs.mkdir(None, "d").unwrap();
        let d = open_path(&fs, None, "d").unwrap();
        assert_eq!(
            open_path(&fs, Some(&d), "").unwrap().inode().number(),
            d.inode().number()
        );
    }
}
