//! Bound classification.
//!
//! Partitions the variables by the shape of their box constraints. The
//! partition is derived once from (bl, bu) and shared read-only by the
//! outer iteration and the Newton layer.

/// Seven-way classification of the variables.
///
/// ```text
/// fixed : bl == bu
/// low   : bl finite,  bl < bu
/// upp   : bu finite,  bl < bu
/// two   : low ∩ upp
/// free  : bl = -inf, bu = +inf
/// zlo   : bl == 0,    bl < bu
/// zup   : bu == 0,    bl < bu
/// ```
///
/// A bound whose magnitude reaches `bound_inf` is treated as absent.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundPartition {
    pub fixed: Vec<usize>,
    pub low: Vec<usize>,
    pub upp: Vec<usize>,
    pub two: Vec<usize>,
    pub free: Vec<usize>,
    pub zlo: Vec<usize>,
    pub zup: Vec<usize>,

    /// Membership masks (length n)
    pub is_fixed: Vec<bool>,
    pub is_low: Vec<bool>,
    pub is_upp: Vec<bool>,
}

impl BoundPartition {
    /// Classify bounds. `bl` and `bu` must have equal length; `bl > bu` on a
    /// non-fixed component is not detected here.
    pub fn classify(bl: &[f64], bu: &[f64], bound_inf: f64) -> Self {
        assert_eq!(bl.len(), bu.len(), "bound vectors must have equal length");
        let n = bl.len();

        let mut part = Self {
            fixed: Vec::new(),
            low: Vec::new(),
            upp: Vec::new(),
            two: Vec::new(),
            free: Vec::new(),
            zlo: Vec::new(),
            zup: Vec::new(),
            is_fixed: vec![false; n],
            is_low: vec![false; n],
            is_upp: vec![false; n],
        };

        for j in 0..n {
            let (l, u) = (bl[j], bu[j]);
            if l == u {
                part.fixed.push(j);
                part.is_fixed[j] = true;
                continue;
            }
            let has_low = l > -bound_inf && l < u;
            let has_upp = u < bound_inf && l < u;
            if has_low {
                part.low.push(j);
                part.is_low[j] = true;
            }
            if has_upp {
                part.upp.push(j);
                part.is_upp[j] = true;
            }
            if has_low && has_upp {
                part.two.push(j);
            }
            if l <= -bound_inf && u >= bound_inf {
                part.free.push(j);
            }
            if l == 0.0 && l < u {
                part.zlo.push(j);
            }
            if u == 0.0 && l < u {
                part.zup.push(j);
            }
        }

        part
    }

    pub fn num_vars(&self) -> usize {
        self.is_fixed.len()
    }

    /// Number of complementarity pairs (one per finite bound).
    pub fn num_pairs(&self) -> usize {
        self.low.len() + self.upp.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INF: f64 = 1e20;

    #[test]
    fn test_seven_way_classification() {
        //            fixed  low   upp   two   free  zlo   zup
        let bl = vec![2.0, 1.0, -INF, -1.0, -INF, 0.0, -3.0];
        let bu = vec![2.0, INF, 4.0, 1.0, INF, 5.0, 0.0];
        let p = BoundPartition::classify(&bl, &bu, 9.9e19);

        assert_eq!(p.fixed, vec![0]);
        assert_eq!(p.low, vec![1, 3, 5, 6]);
        assert_eq!(p.upp, vec![2, 3, 5, 6]);
        assert_eq!(p.two, vec![3, 5, 6]);
        assert_eq!(p.free, vec![4]);
        assert_eq!(p.zlo, vec![5]);
        assert_eq!(p.zup, vec![6]);
        assert_eq!(p.num_pairs(), 8);
    }

    #[test]
    fn test_fixed_zero_is_not_zero_bounded() {
        // bl == bu == 0: fixed only, never zlo/zup.
        let p = BoundPartition::classify(&[0.0], &[0.0], 9.9e19);
        assert_eq!(p.fixed, vec![0]);
        assert!(p.zlo.is_empty() && p.zup.is_empty());
        assert!(p.low.is_empty() && p.upp.is_empty() && p.free.is_empty());
    }

    #[test]
    fn test_sentinel_threshold() {
        let p = BoundPartition::classify(&[-9.9e19, -1e19], &[9.9e19, 1e19], 9.9e19);
        assert_eq!(p.free, vec![0]);
        assert_eq!(p.two, vec![1]);
    }
}
