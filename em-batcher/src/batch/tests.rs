use super::*;
use crate::consts::batch_range::FIRST_RAND_NOLOOKUP_BATCH;
use crate::consts::label::EMPTY_LABEL;
use crate::labels::IndepScheme;
use crate::store::MemStore;

/// `[80, 80, 16]` 的棋盘格体, 存储块 `[8, 8, 8]`. 数据在每个 z 块上加 `10 * z`.
fn checker_store() -> MemStore {
    let data = Array3::from_shape_fn((80, 80, 16), |(x, y, z)| ((x + y) % 2 + 10 * (z / 8)) as f32);
    let labels = Array3::from_shape_fn((80, 80, 16), |(x, y, _)| ((x + y) % 2) as u32);
    let mut st = MemStore::new();
    st.insert_data("data", data, [8, 8, 8]).unwrap();
    st.insert_labels("labels", labels, [8, 8, 8]).unwrap();
    st
}

fn cfg() -> ParserConfig {
    ParserConfig {
        data_dataset: "data".into(),
        label_dataset: "labels".into(),
        chunk_rand: [1, 1, 0],
        image_size: 9,
        nzslices: 1,
        tile_size: [8, 8, 1],
        size_rand: [64, 64, 1],
        nz_tiled: 0,
        rng_seed: Some(7),
        ..Default::default()
    }
}

fn generator(st: &MemStore, cfg: ParserConfig) -> BatchGenerator<&MemStore> {
    let mut g = BatchGenerator::new(cfg, Sources::shared(st)).unwrap();
    g.init_batches().unwrap();
    g
}

const DISPLAY: BatchOptions = BatchOptions {
    for_display: true,
    tiled_aug: 0,
};

/// 第一个平铺批次覆盖左上角的 8x8 平铺块, 样本按块内 y 最快的顺序排列.
#[test]
fn test_tiled_batch_reproduces_checkerboard() {
    let st = checker_store();
    let mut g = generator(
        &st,
        ParserConfig {
            no_label_lookup: true,
            ..cfg()
        },
    );
    let b = g.get_batch(FIRST_TILED_BATCH, &DISPLAY, None).unwrap();
    assert_eq!(b.data.dim(), (81, 64));
    assert_eq!(b.labels.dim(), (1, 64));
    for k in 0..64 {
        let (px, py) = (k / 8, k % 8);
        let expected = ((px + py) % 2) as f32;
        // 中心像素.
        assert_eq!(b.data[(40, k)], expected, "case {k}");
        assert_eq!(b.labels[(0, k)], expected, "case {k}");
        assert_eq!(b.seg_labels[(0, k)], expected as u32);
        // 补丁左上角与中心相差 (4, 4), 奇偶相同.
        assert_eq!(b.data[(0, k)], expected);
        assert_eq!(b.data[(1, k)], 1.0 - expected);
    }

    // 第二个平铺批次沿 x 方向移动一个平铺块.
    let b2 = g.get_batch(FIRST_TILED_BATCH + 1, &DISPLAY, None).unwrap();
    assert_eq!(b2.data.column(0), b.data.column(0));

    // 一个 z 切片共 64 个批次.
    assert!(g.get_batch(FIRST_TILED_BATCH + 63, &DISPLAY, None).is_ok());
    assert!(matches!(
        g.get_batch(FIRST_TILED_BATCH + 64, &DISPLAY, None),
        Err(EmError::TiledBatchOutOfRange { zslice: 1, ntotal: 1, .. })
    ));
}

/// 9:1 的可选体素比例在先验 `[0.5, 0.5]` 下被平衡到约 1:1.
#[test]
fn test_balanced_batches_follow_priors() {
    let mut st = checker_store();
    let labels = Array3::from_shape_fn((80, 80, 16), |(x, _, _)| (x % 10 != 0) as u32);
    st.insert_labels("labels", labels, [8, 8, 8]).unwrap();
    let mut g = generator(&st, cfg());
    let lk = g.lookup().unwrap();
    // 随机区 x 覆盖 [8, 72), 其中 7 列为 OUT.
    assert_eq!(lk.lens(), vec![7 * 64, 57 * 64]);
    assert!(lk.rand_priors()[1] > 0.85);

    let mut counts = g.prior_counts();
    for n in 1..=1000 {
        let b = g.get_batch(n, &DISPLAY, Some(&mut counts)).unwrap();
        for k in 0..64 {
            let ics = (b.seg_labels[(0, k)] > 0) as u8 as f32;
            assert_eq!(b.labels[(0, k)], ics);
        }
    }
    assert_eq!(counts.total, 64_000);
    let p = counts.train_priors().unwrap();
    assert!((p[0] - 0.5).abs() < 0.02, "{p:?}");
    assert!((p[1] - 0.5).abs() < 0.02, "{p:?}");
}

#[test]
fn test_uniform_batches() {
    let st = checker_store();
    let mut g = generator(
        &st,
        ParserConfig {
            no_label_lookup: true,
            ..cfg()
        },
    );
    let mut counts = g.prior_counts();
    let b = g
        .get_batch(FIRST_RAND_NOLOOKUP_BATCH, &DISPLAY, Some(&mut counts))
        .unwrap();
    assert_eq!(b.data.dim(), (81, 64));
    for k in 0..64 {
        assert_eq!(b.data[(40, k)], b.labels[(0, k)]);
    }
    assert_eq!(counts.total, 64);

    // 平铺批次不计入先验.
    g.get_batch(FIRST_TILED_BATCH, &DISPLAY, Some(&mut counts)).unwrap();
    assert_eq!(counts.total, 64);

    assert!(matches!(
        g.get_batch(1, &DISPLAY, None),
        Err(EmError::RegimeUnavailable(_))
    ));
}

/// 未标注体素不进查找表, 但均匀与平铺采样落在其上时目标仍是合法类别.
#[test]
fn test_unlabeled_voxels_get_valid_targets() {
    let mut st = checker_store();
    let mut labels = Array3::from_shape_fn((80, 80, 16), |(x, y, _)| {
        if x % 3 == 0 {
            EMPTY_LABEL
        } else {
            ((x + y) % 2) as u32
        }
    });
    labels[(8, 8, 0)] = EMPTY_LABEL;
    st.insert_labels("labels", labels, [8, 8, 8]).unwrap();
    let mut g = generator(
        &st,
        ParserConfig {
            no_label_lookup: true,
            ..cfg()
        },
    );

    let b = g.get_batch(FIRST_TILED_BATCH, &DISPLAY, None).unwrap();
    assert_eq!(b.seg_labels[(0, 0)], EMPTY_LABEL);
    assert_eq!(b.labels[(0, 0)], 1.0);
    assert!(b.labels.iter().all(|&v| v == 0.0 || v == 1.0));

    let mut counts = g.prior_counts();
    let b = g
        .get_batch(FIRST_RAND_NOLOOKUP_BATCH, &DISPLAY, Some(&mut counts))
        .unwrap();
    assert!(b.seg_labels.row(0).iter().any(|&v| v == EMPTY_LABEL));
    for k in 0..64 {
        let expected = (b.seg_labels[(0, k)] > 0) as u8 as f32;
        assert_eq!(b.labels[(0, k)], expected, "case {k}");
    }
    assert_eq!(counts.counts.iter().sum::<u64>(), 64);
}

#[test]
fn test_not_initialized() {
    let st = checker_store();
    let mut g = BatchGenerator::new(cfg(), Sources::shared(&st)).unwrap();
    assert!(g.meta().is_none());
    assert!(matches!(
        g.get_batch(1, &DISPLAY, None),
        Err(EmError::NotInitialized)
    ));
}

#[test]
fn test_normalization() {
    let st = checker_store();
    let mut g = generator(
        &st,
        ParserConfig {
            no_label_lookup: true,
            em_mean: 0.5,
            em_std: 0.5,
            ..cfg()
        },
    );
    let b = g
        .get_batch(FIRST_TILED_BATCH, &BatchOptions::default(), None)
        .unwrap();
    assert!(b.data.iter().all(|&v| v == 1.0 || v == -1.0));

    // 未配置时使用实测统计, 棋盘格的均值为 0.5, 标准差为 0.5.
    let mut g = generator(
        &st,
        ParserConfig {
            no_label_lookup: true,
            ..cfg()
        },
    );
    let (mean, std) = g.data_stats();
    assert!((mean - 0.5).abs() < 1e-9);
    assert!((std - 0.5).abs() < 1e-9);
    let b = g
        .get_batch(FIRST_TILED_BATCH, &BatchOptions::default(), None)
        .unwrap();
    assert!(b.data.iter().all(|&v| (v.abs() - 1.0).abs() < 1e-6));
}

#[test]
fn test_meta_and_label_modes() {
    let st = checker_store();
    let g = generator(&st, cfg());
    let m = g.meta().unwrap();
    assert_eq!(m.num_cases_per_batch, 64);
    assert_eq!(m.label_names, vec!["OUT".to_string(), "ICS".to_string()]);
    assert_eq!(m.nlabels, 2);
    assert_eq!(m.pixels_per_image, 81);
    assert_eq!(m.noutputs, 1);

    let mut g = generator(
        &st,
        ParserConfig {
            no_labels: true,
            no_label_lookup: true,
            ..cfg()
        },
    );
    assert_eq!(g.meta().unwrap().noutputs, 0);
    assert!(g.meta().unwrap().label_names.is_empty());
    let b = g.get_batch(FIRST_TILED_BATCH, &DISPLAY, None).unwrap();
    assert_eq!(b.labels.dim(), (0, 64));
    assert_eq!(b.seg_labels.dim(), (0, 64));

    let mut g = generator(
        &st,
        ParserConfig {
            zero_labels: true,
            no_label_lookup: true,
            ..cfg()
        },
    );
    let b = g.get_batch(FIRST_TILED_BATCH, &DISPLAY, None).unwrap();
    assert_eq!(b.labels, Array2::<f32>::zeros((1, 64)));
    assert_eq!(b.seg_labels.nrows(), 0);

    let mut g = generator(
        &st,
        ParserConfig {
            independent_labels: true,
            label_type: IndepScheme::IcsOrOut,
            no_label_lookup: true,
            ..cfg()
        },
    );
    assert_eq!(g.meta().unwrap().noutputs, 2);
    let b = g.get_batch(FIRST_TILED_BATCH, &DISPLAY, None).unwrap();
    assert_eq!(b.labels.dim(), (2, 64));
    for k in 0..64 {
        let ics = b.seg_labels[(0, k)] as f32;
        assert_eq!(b.labels[(0, k)], ics);
        assert_eq!(b.labels[(1, k)], 1.0 - ics);
    }
}

/// 块列表模式: 同一块不重新缓冲, 换块时统计随之更新.
#[test]
fn test_chunk_list_switching() {
    let st = checker_store();
    let c = ParserConfig {
        chunk_range_beg: vec![[1, 1, 0], [1, 1, 1]],
        no_label_lookup: true,
        ..cfg()
    };
    let mut g = generator(&st, c);
    let first = ChunkPos::new([1, 1, 0], [0, 0, 0]);
    let second = ChunkPos::new([1, 1, 1], [0, 0, 0]);
    assert_eq!(
        g.chunk_state(),
        Some(StreamState::Loaded {
            current: first,
            previous: first
        })
    );
    assert!((g.data_stats().0 - 0.5).abs() < 1e-9);

    g.get_batch(FIRST_RAND_NOLOOKUP_BATCH, &DISPLAY, None).unwrap();
    assert_eq!(g.chunk_state().unwrap().current(), Some(first));

    g.get_batch(FIRST_RAND_NOLOOKUP_BATCH, &DISPLAY, None).unwrap();
    assert_eq!(
        g.chunk_state(),
        Some(StreamState::Loaded {
            current: second,
            previous: first
        })
    );
    assert!((g.data_stats().0 - 10.5).abs() < 1e-9);

    // 平铺批次按编号选块: 第二块的第一个批次.
    let bprc = g.geometry().batches_per_rand_cube as u32;
    let b = g.get_batch(FIRST_TILED_BATCH + bprc, &DISPLAY, None).unwrap();
    assert_eq!(g.chunk_state().unwrap().current(), Some(second));
    assert_eq!(b.data[(40, 0)], 10.0);
    let b = g.get_batch(FIRST_TILED_BATCH, &DISPLAY, None).unwrap();
    assert_eq!(g.chunk_state().unwrap().current(), Some(first));
    assert_eq!(b.data[(40, 0)], 0.0);
    assert!(matches!(
        g.get_batch(FIRST_TILED_BATCH + 2 * bprc, &DISPLAY, None),
        Err(EmError::ChunkOutOfRange { chunk: 2, len: 2 })
    ));
}
