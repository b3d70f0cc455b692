//! 批次生成延迟消融实验.
//!
//! 批次生成与网络前向/反向并行进行, 因此单个批次的生成时间必须小于一个训练步.
//! 这里分别测量三种采样方式在合成体上的逐批次耗时.

mod profile;
mod result;
mod runner;

fn main() {
    simple_logger::init_with_level(log::Level::Warn).unwrap();
    runner::run().analyze();
}
