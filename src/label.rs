use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maps class names to one-hot rows and back.
///
/// Classes are kept in lexicographic order, so the column of a class does not
/// depend on the order in which images were discovered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelEncoder {
    classes: Vec<String>,
}

impl LabelEncoder {
    pub fn fit<S: AsRef<str>>(labels: &[S]) -> Result<Self> {
        let mut classes: Vec<String> = labels.iter().map(|l| l.as_ref().to_owned()).collect();
        classes.sort();
        classes.dedup();

        if classes.len() < 2 {
            return Err(Error::Config(format!(
                "need at least two classes to train a classifier, found {}",
                classes.len()
            )));
        }

        Ok(Self { classes })
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn index_of(&self, label: &str) -> Result<usize> {
        self.classes
            .binary_search_by(|class| class.as_str().cmp(label))
            .map_err(|_| Error::UnknownLabel(label.to_owned()))
    }

    pub fn indices<S: AsRef<str>>(&self, labels: &[S]) -> Result<Vec<usize>> {
        labels.iter().map(|l| self.index_of(l.as_ref())).collect()
    }

    /// One row per label, a single 1.0 at the class column.
    pub fn transform<S: AsRef<str>>(&self, labels: &[S]) -> Result<Array2<f32>> {
        let mut one_hot = Array2::zeros((labels.len(), self.classes.len()));
        for (row, label) in labels.iter().enumerate() {
            one_hot[[row, self.index_of(label.as_ref())?]] = 1.0;
        }
        Ok(one_hot)
    }

    pub fn decode(&self, index: usize) -> Option<&str> {
        self.classes.get(index).map(String::as_str)
    }

    /// Decodes the column holding the largest value of `row`.
    pub fn decode_row(&self, row: ArrayView1<f32>) -> Option<&str> {
        argmax(row).and_then(|index| self.decode(index))
    }
}

/// Index of the first maximum; `None` for an empty row.
pub fn argmax(row: ArrayView1<f32>) -> Option<usize> {
    row.iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, bv)) if bv >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_are_sorted_and_unique() {
        let encoder = LabelEncoder::fit(&["without_mask", "with_mask", "without_mask"]).unwrap();
        assert_eq!(encoder.classes(), &["with_mask", "without_mask"]);
    }

    #[test]
    fn one_hot_round_trips_through_argmax() {
        let labels = ["with_mask", "without_mask", "without_mask", "with_mask"];
        let encoder = LabelEncoder::fit(&labels).unwrap();
        let one_hot = encoder.transform(&labels).unwrap();

        assert_eq!(one_hot.shape(), &[4, 2]);
        for (row, label) in one_hot.rows().into_iter().zip(labels) {
            assert_eq!(row.sum(), 1.0);
            assert_eq!(encoder.decode_row(row), Some(label));
        }
    }

    #[test]
    fn single_class_is_rejected() {
        assert!(matches!(
            LabelEncoder::fit(&["with_mask", "with_mask"]),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn unseen_label_is_an_error() {
        let encoder = LabelEncoder::fit(&["a", "b"]).unwrap();
        assert!(matches!(encoder.transform(&["c"]), Err(Error::UnknownLabel(l)) if l == "c"));
    }

    #[test]
    fn argmax_prefers_first_maximum() {
        let row = ndarray::arr1(&[0.2, 0.4, 0.4]);
        assert_eq!(argmax(row.view()), Some(1));
    }
}
