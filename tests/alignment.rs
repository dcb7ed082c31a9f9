use std::path::Path;

use rezip::{AlignmentRules, CompressionMethod, ZipFile, ZipFileOptions};

fn aligned(rules: AlignmentRules) -> ZipFileOptions {
    ZipFileOptions {
        alignment: rules,
        no_timestamps: true,
        ..Default::default()
    }
}

async fn write_unaligned(path: &Path) {
    let mut zip = ZipFile::open(path, aligned(AlignmentRules::new()))
        .await
        .unwrap();
    zip.add("a.so", b"native".to_vec(), CompressionMethod::Stored)
        .unwrap();
    zip.add("b.txt", b"bbb".to_vec(), CompressionMethod::Stored)
        .unwrap();
    zip.close().await.unwrap();
}

#[tokio::test]
async fn data_lands_on_the_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.zip");

    let mut zip = ZipFile::open(&path, aligned(AlignmentRules::constant(1024)))
        .await
        .unwrap();
    zip.add("test.txt", b"This is some text.".to_vec(), CompressionMethod::Stored)
        .unwrap();
    zip.close().await.unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[1024..1042], b"This is some text.");
    assert!(bytes[..986].iter().all(|&b| b == 0));
    assert_eq!(&bytes[986..990], b"PK\x03\x04");
}

#[tokio::test]
async fn rules_apply_by_name() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.zip");
    let rules = AlignmentRules::new()
        .with_pattern("lib/**/*.so", 4096)
        .unwrap()
        .with_suffix(".arsc", 4);

    let mut zip = ZipFile::open(&path, aligned(rules)).await.unwrap();
    zip.add("classes.dex", vec![1u8; 33], CompressionMethod::Stored)
        .unwrap();
    zip.add("lib/arm64-v8a/libfoo.so", vec![2u8; 10], CompressionMethod::Stored)
        .unwrap();
    zip.add("resources.arsc", vec![3u8; 10], CompressionMethod::Stored)
        .unwrap();
    zip.close().await.unwrap();

    let mut zip = ZipFile::open(&path, ZipFileOptions::default())
        .await
        .unwrap();
    assert_eq!(zip.get("classes.dex").unwrap().data_offset(), Some(41));
    let so = zip.get("lib/arm64-v8a/libfoo.so").unwrap();
    assert_eq!(so.data_offset().unwrap() % 4096, 0);
    let arsc = zip.get("resources.arsc").unwrap();
    assert_eq!(arsc.data_offset().unwrap() % 4, 0);
    assert_eq!(arsc.read().await.unwrap(), vec![3u8; 10]);
    zip.close().await.unwrap();
}

#[tokio::test]
async fn existing_entries_move_only_when_realigned() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.zip");
    write_unaligned(&path).await;

    let mut zip = ZipFile::open(&path, aligned(AlignmentRules::constant_for_suffix(".so", 4096)))
        .await
        .unwrap();
    assert_eq!(zip.get("a.so").unwrap().data_offset(), Some(34));

    assert!(zip.realign("a.so").await.unwrap());
    assert!(!zip.realign("a.so").await.unwrap());
    assert!(!zip.realign("b.txt").await.unwrap());
    zip.close().await.unwrap();

    let mut zip = ZipFile::open(&path, ZipFileOptions::default())
        .await
        .unwrap();
    let so = zip.get("a.so").unwrap();
    assert_eq!(so.data_offset(), Some(4096));
    assert_eq!(so.read().await.unwrap(), b"native");
    assert_eq!(zip.get("b.txt").unwrap().offset(), Some(40));
    zip.close().await.unwrap();
}

#[tokio::test]
async fn aligned_entries_are_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.zip");
    write_unaligned(&path).await;

    // a.so data starts at 34, b.txt data at 75
    let mut zip = ZipFile::open(&path, aligned(AlignmentRules::constant_for_suffix(".so", 2)))
        .await
        .unwrap();
    assert!(!zip.realign_all().await.unwrap());
    assert!(!zip.is_dirty());
    zip.close().await.unwrap();

    let mut zip = ZipFile::open(&path, aligned(AlignmentRules::constant(4)))
        .await
        .unwrap();
    assert!(zip.realign_all().await.unwrap());
    zip.close().await.unwrap();

    let mut zip = ZipFile::open(&path, ZipFileOptions::default())
        .await
        .unwrap();
    for entry in zip.entries() {
        assert_eq!(entry.data_offset().unwrap() % 4, 0, "{}", entry.name());
    }
    zip.close().await.unwrap();
}

#[tokio::test]
async fn empty_space_is_covered_by_extra_fields() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.zip");
    let covering = ZipFileOptions {
        cover_empty_space_using_extra_field: true,
        no_timestamps: true,
        ..Default::default()
    };

    let mut zip = ZipFile::open(&path, covering.clone()).await.unwrap();
    for (name, byte) in [("a", 1u8), ("b", 2), ("c", 3)] {
        zip.add(name, vec![byte; 100], CompressionMethod::Stored)
            .unwrap();
    }
    zip.close().await.unwrap();

    let mut zip = ZipFile::open(&path, covering.clone()).await.unwrap();
    zip.delete("b").unwrap();
    zip.close().await.unwrap();

    assert_eq!(std::fs::metadata(&path).unwrap().len(), 393 + 94 + 22);
    let mut zip = ZipFile::open(&path, covering).await.unwrap();
    let c = zip.get("c").unwrap();
    assert_eq!(c.offset(), Some(131));
    assert_eq!(c.data_offset(), Some(293));
    assert_eq!(c.local_extra().len(), 131);
    assert_eq!(&c.local_extra()[..2], &[0x35u8, 0xd9]);
    assert_eq!(c.read().await.unwrap(), vec![3u8; 100]);
    assert_eq!(zip.used_size(), zip.tracked_size());
    zip.close().await.unwrap();
}

#[tokio::test]
async fn alignment_padding_is_covered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("a.zip");
    let options = ZipFileOptions {
        alignment: AlignmentRules::constant_for_suffix(".so", 4096),
        cover_empty_space_using_extra_field: true,
        ..Default::default()
    };

    let mut zip = ZipFile::open(&path, options).await.unwrap();
    zip.add("x.so", vec![7u8; 64], CompressionMethod::Stored)
        .unwrap();
    zip.close().await.unwrap();

    let mut zip = ZipFile::open(&path, ZipFileOptions::default())
        .await
        .unwrap();
    let so = zip.get("x.so").unwrap();
    assert_eq!(so.offset(), Some(0));
    assert_eq!(so.data_offset(), Some(4096));
    assert_eq!(so.read().await.unwrap(), vec![7u8; 64]);
    zip.close().await.unwrap();
}
