//! 程序运行函数.

use crate::profile::Profile;
use crate::result::AblationResult;
use em_batcher::prelude::*;
use log::warn;
use std::thread;
use utils::synthetic;

/// 每种采样方式测量的批次数.
const NBATCHES: u32 = 200;

fn config() -> ParserConfig {
    ParserConfig {
        data_dataset: synthetic::DATA.to_string(),
        label_dataset: synthetic::LABELS.to_string(),
        chunk_rand: [1, 1, 0],
        offset_rand: [0, 0, 1],
        image_size: 65,
        nzslices: 3,
        tile_size: [16, 16, 1],
        size_rand: [128, 128, 16],
        nz_tiled: 0,
        rng_seed: Some(0),
        ..Default::default()
    }
}

/// 在 `store` 上从 `first` 起连续生成批次并计时.
fn measure<S: VolumeStore>(store: &S, first: u32) -> Profile {
    let mut profile = Profile::new();
    let mut gen = BatchGenerator::new(config(), Sources::shared(store)).unwrap();
    gen.init_batches().unwrap();
    let opts = BatchOptions::default();
    let mut counts = gen.prior_counts();
    for n in first..first + NBATCHES {
        profile.batch_start();
        let b = gen.get_batch(n, &opts, Some(&mut counts)).unwrap();
        profile.batch_elapsed(b.data.ncols());
    }
    profile.finish()
}

/// 在 `store` 上并行测量三种采样方式.
fn run_on<S: VolumeStore + Sync>(store: &S) -> AblationResult {
    println!("Running ablation studies on {} cpus...", utils::cpus());
    thread::scope(|s| {
        let firsts = [1, FIRST_RAND_NOLOOKUP_BATCH, FIRST_TILED_BATCH];
        let handles = firsts.map(|first| s.spawn(move || measure(store, first)));

        AblationResult::from_iter(
            ["balanced", "uniform", "tiled"].into_iter().zip(
                handles
                    .into_iter()
                    .map(|th| th.join().expect("Thread joining error")),
            ),
        )
    })
}

/// 实际运行.
///
/// 存在 `$EM_STORE_DIR` (或 `$HOME/dataset/em`) 目录存储时在其上测量,
/// 否则退回合成体.
pub fn run() -> AblationResult {
    match utils::store_from_env_or_home() {
        Some(Ok(store)) => {
            println!("Using store at {}", store.root().display());
            return run_on(&store);
        }
        Some(Err(e)) => warn!("cannot open store directory ({e}), using synthetic volume"),
        None => {}
    }
    let store = synthetic::cell_store([384, 384, 32], [128, 128, 16]).expect("Synthetic store error");
    run_on(&store)
}
