//! 批次生成统计.

use std::time::{Duration, Instant};

/// ablation/benchmark 计时器.
///
/// 该计时器支持 "中途中断" 与 "结束中断, 继续开始计时".
#[derive(Clone, Debug)]
struct AccTimer {
    consumed: Duration,
    since: Instant,
}

impl AccTimer {
    /// 初始化计时器. 初始化时会视为已经开始计时.
    #[inline]
    fn new() -> Self {
        Self {
            consumed: Duration::ZERO,
            since: Instant::now(),
        }
    }

    #[inline]
    fn start(&mut self) {
        self.since = Instant::now();
    }

    /// 结束计时, 并将这一区间的时间累加. 返回本轮计时时长.
    ///
    /// # 注意
    ///
    /// 上一次调用必须是 `self.start()`, 否则计算时间值无意义.
    #[inline]
    fn elapsed(&mut self) -> Duration {
        let d = self.since.elapsed();
        self.consumed += d;
        d
    }

    #[inline]
    fn get_total_us(&self) -> u64 {
        self.consumed.as_micros() as u64
    }

    #[inline]
    fn get_total_secs(&self) -> f64 {
        self.consumed.as_secs_f64()
    }
}

/// 一种采样方式的批次生成统计.
#[derive(Clone, Debug)]
pub struct Profile {
    /// 生成的批次数.
    batches: u64,

    /// 生成的样本数.
    cases: u64,

    /// 生成批次花费的总时间.
    batch_time: AccTimer,

    /// 整个任务花费的总时间 (包括缓冲立方体与建表).
    real_time: AccTimer,

    /// 最耗时的一个批次.
    most: Option<Duration>,
}

impl Profile {
    /// 初始化.
    #[inline]
    pub fn new() -> Self {
        Self {
            batches: 0,
            cases: 0,
            batch_time: AccTimer::new(),
            real_time: AccTimer::new(),
            most: None,
        }
    }

    /// 开始一个批次的计时.
    #[inline]
    pub fn batch_start(&mut self) {
        self.batch_time.start();
    }

    /// 结束一个含 `cases` 个样本的批次的计时.
    #[inline]
    pub fn batch_elapsed(&mut self, cases: usize) {
        let d = self.batch_time.elapsed();
        self.batches += 1;
        self.cases += cases as u64;
        self.most = Some(self.most.map_or(d, |m| m.max(d)));
    }

    /// 结束全部计时.
    #[inline]
    pub fn finish(mut self) -> Self {
        self.real_time.elapsed();
        self
    }

    /// 批次数.
    #[inline]
    pub fn get_batches(&self) -> u64 {
        self.batches
    }

    /// 样本数.
    #[inline]
    pub fn get_cases(&self) -> u64 {
        self.cases
    }

    /// 以微秒为单位获得生成批次的总时间.
    #[inline]
    pub fn get_batch_time_us(&self) -> u64 {
        self.batch_time.get_total_us()
    }

    /// 以微秒为单位获得任务的总自然时间.
    #[inline]
    pub fn get_real_time_us(&self) -> u64 {
        self.real_time.get_total_us()
    }

    /// 以微秒为单位获得每批次平均时间.
    #[inline]
    pub fn get_avg_batch_time_us(&self) -> Option<f64> {
        match self.batches {
            0 => None,
            n => Some(self.get_batch_time_us() as f64 / n as f64),
        }
    }

    /// 每秒生成的样本数. 尚未计时时返回 `None`.
    #[inline]
    pub fn get_case_rate(&self) -> Option<f64> {
        let t = self.batch_time.get_total_secs();
        (self.cases > 0 && t > 0.0).then(|| self.cases as f64 / t)
    }

    /// 最耗时的一个批次. 如果不存在批次, 则返回 `None`.
    #[inline]
    pub fn get_most_time_consuming(&self) -> Option<Duration> {
        self.most
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self::new()
    }
}
