use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassScores {
    pub name: String,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Per-class precision, recall and F1, plus accuracy and averages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationReport {
    pub classes: Vec<ClassScores>,
    pub accuracy: f64,
    pub support: usize,
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

impl ClassificationReport {
    /// `y_true` and `y_pred` hold class indices into `class_names`.
    pub fn new(y_true: &[usize], y_pred: &[usize], class_names: &[String]) -> Self {
        let pairs: Vec<(usize, usize)> = y_true.iter().copied().zip(y_pred.iter().copied()).collect();

        let classes = class_names
            .iter()
            .enumerate()
            .map(|(class, name)| {
                let tp = pairs.iter().filter(|&&(t, p)| t == class && p == class).count();
                let predicted = pairs.iter().filter(|&&(_, p)| p == class).count();
                let support = pairs.iter().filter(|&&(t, _)| t == class).count();

                let precision = ratio(tp, predicted);
                let recall = ratio(tp, support);
                let f1 = if precision + recall > 0.0 {
                    2.0 * precision * recall / (precision + recall)
                } else {
                    0.0
                };

                ClassScores {
                    name: name.clone(),
                    precision,
                    recall,
                    f1,
                    support,
                }
            })
            .collect();

        let correct = pairs.iter().filter(|(t, p)| t == p).count();

        Self {
            classes,
            accuracy: ratio(correct, pairs.len()),
            support: pairs.len(),
        }
    }

    pub fn class_names(&self) -> Vec<&str> {
        self.classes.iter().map(|c| c.name.as_str()).collect()
    }

    /// Unweighted mean of (precision, recall, f1).
    pub fn macro_avg(&self) -> (f64, f64, f64) {
        let n = self.classes.len().max(1) as f64;
        let sum = |f: fn(&ClassScores) -> f64| self.classes.iter().map(f).sum::<f64>() / n;
        (sum(|c| c.precision), sum(|c| c.recall), sum(|c| c.f1))
    }

    /// Support-weighted mean of (precision, recall, f1).
    pub fn weighted_avg(&self) -> (f64, f64, f64) {
        let total = self.classes.iter().map(|c| c.support).sum::<usize>();
        if total == 0 {
            return (0.0, 0.0, 0.0);
        }
        let sum = |f: fn(&ClassScores) -> f64| {
            self.classes
                .iter()
                .map(|c| f(c) * c.support as f64)
                .sum::<f64>()
                / total as f64
        };
        (sum(|c| c.precision), sum(|c| c.recall), sum(|c| c.f1))
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = self
            .classes
            .iter()
            .map(|c| c.name.len())
            .chain(["weighted avg".len()])
            .max()
            .unwrap_or_default();

        writeln!(
            f,
            "{:>width$}  {:>9} {:>9} {:>9} {:>9}",
            "", "precision", "recall", "f1-score", "support"
        )?;
        writeln!(f)?;

        let row = |f: &mut fmt::Formatter<'_>, name: &str, (p, r, f1): (f64, f64, f64), support: usize| {
            writeln!(f, "{name:>width$}  {p:>9.2} {r:>9.2} {f1:>9.2} {support:>9}")
        };

        for class in &self.classes {
            row(f, &class.name, (class.precision, class.recall, class.f1), class.support)?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "{:>width$}  {:>9} {:>9} {:>9.2} {:>9}",
            "accuracy", "", "", self.accuracy, self.support
        )?;
        row(f, "macro avg", self.macro_avg(), self.support)?;
        row(f, "weighted avg", self.weighted_avg(), self.support)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["with_mask".to_owned(), "without_mask".to_owned()]
    }

    #[test]
    fn scores_follow_confusion_counts() {
        // 3 true positives for class 0, one class-1 sample predicted as 0
        let report = ClassificationReport::new(&[0, 0, 0, 1, 1], &[0, 0, 0, 0, 1], &names());

        let with_mask = &report.classes[0];
        assert_eq!(with_mask.precision, 0.75);
        assert_eq!(with_mask.recall, 1.0);
        assert_eq!(with_mask.support, 3);

        let without_mask = &report.classes[1];
        assert_eq!(without_mask.precision, 1.0);
        assert_eq!(without_mask.recall, 0.5);
        assert!((without_mask.f1 - 2.0 / 3.0).abs() < 1e-12);

        assert_eq!(report.accuracy, 0.8);
    }

    #[test]
    fn never_predicted_class_scores_zero() {
        let report = ClassificationReport::new(&[0, 1], &[0, 0], &names());
        assert_eq!(report.classes[1].precision, 0.0);
        assert_eq!(report.classes[1].f1, 0.0);
    }

    #[test]
    fn rendered_report_lists_each_class_once() {
        let report = ClassificationReport::new(&[0, 1, 1], &[0, 1, 0], &names());
        let text = report.to_string();

        assert!(text.starts_with(&format!("{:>12}  {:>9}", "", "precision")));
        assert_eq!(text.matches("without_mask").count(), 1);
        assert_eq!(text.lines().filter(|l| l.trim_start().starts_with("with_mask")).count(), 1);
        assert!(text.contains("weighted avg"));
        assert_eq!(report.class_names(), vec!["with_mask", "without_mask"]);
    }
}
