//! 实验结果.

use crate::profile::Profile;
use std::io::{self, Write};

/// 以毫秒显示可选的微秒数.
fn ms(us: Option<f64>) -> String {
    us.map_or_else(|| "/".to_string(), |us| format!("{:.3}", us / 1000.0))
}

/// 一行表头.
fn header_into<W: Write>(w: &mut W) -> io::Result<()> {
    writeln!(
        w,
        "{:<10}{:>9}{:>10}{:>12}{:>12}{:>14}",
        "regime", "batches", "cases", "avg ms", "max ms", "cases/s"
    )
}

/// 将 `p` 的结果作为一行写进 `w` 中.
fn describe_into<W: Write>(name: &str, p: &Profile, w: &mut W) -> io::Result<()> {
    let rate = p
        .get_case_rate()
        .map_or_else(|| "/".to_string(), |r| format!("{r:.0}"));
    let most = p.get_most_time_consuming().map(|d| d.as_micros() as f64);
    writeln!(
        w,
        "{name:<10}{:>9}{:>10}{:>12}{:>12}{rate:>14}",
        p.get_batches(),
        p.get_cases(),
        ms(p.get_avg_batch_time_us()),
        ms(most),
    )
}

/// 消融实验最终结果.
pub struct AblationResult {
    data: Vec<(&'static str, Profile)>,
}

impl AblationResult {
    pub fn from_iter<I: IntoIterator<Item = (&'static str, Profile)>>(it: I) -> Self {
        Self {
            data: it.into_iter().collect(),
        }
    }

    /// 写出汇总表: 每种采样方式一行, 最后是最慢方式与总机时.
    pub fn report_into<W: Write>(&self, mut w: W) -> io::Result<()> {
        utils::sep_to(&mut w)?;
        header_into(&mut w)?;
        for (key, profile) in self.data.iter() {
            describe_into(key, profile, &mut w)?;
        }
        utils::sep_to(&mut w)?;

        let slowest = self
            .data
            .iter()
            .filter_map(|(k, p)| Some((*k, p.get_avg_batch_time_us()?)))
            .max_by(|a, b| a.1.total_cmp(&b.1));
        if let Some((k, us)) = slowest {
            writeln!(w, "Slowest regime `{k}`: {} ms per batch", ms(Some(us)))?;
        }
        let real: u64 = self.data.iter().map(|(_, p)| p.get_real_time_us()).sum();
        writeln!(w, "Total machine time: {} ms", ms(Some(real as f64)))?;
        utils::sep_to(&mut w)
    }

    /// 分析运行结果.
    pub fn analyze(&self) {
        if let Err(e) = self.report_into(io::stdout().lock()) {
            eprintln!("cannot write report: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_layout() {
        let mut p = Profile::new();
        p.batch_start();
        p.batch_elapsed(64);
        let r = AblationResult::from_iter([("tiled", p.finish()), ("uniform", Profile::new())]);
        let mut buf = Vec::new();
        r.report_into(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert!(lines[1].starts_with("regime"));
        assert!(lines[2].starts_with("tiled"));
        assert!(lines[2].contains(" 64"));
        // 没有批次时显示 `/`.
        assert!(lines[3].starts_with("uniform") && lines[3].ends_with('/'));
        assert!(text.contains("Slowest regime `tiled`"));
    }
}
