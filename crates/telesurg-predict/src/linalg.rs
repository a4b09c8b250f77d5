//! Small dense solver for the least-squares fits

/// Solve `a · x = b` for an `n × n` row-major `a` by Gaussian elimination with
/// partial pivoting. `None` when singular.
pub(crate) fn solve(mut a: Vec<f64>, mut b: Vec<f64>) -> Option<Vec<f64>> {
    let n = b.len();
    if a.len() != n * n {
        return None;
    }

    for col in 0..n {
        let pivot = (col..n).max_by(|&i, &j| a[i * n + col].abs().total_cmp(&a[j * n + col].abs()))?;
        if a[pivot * n + col].abs() < 1e-12 {
            return None;
        }
        if pivot != col {
            for k in 0..n {
                a.swap(pivot * n + k, col * n + k);
            }
            b.swap(pivot, col);
        }

        for row in col + 1..n {
            let factor = a[row * n + col] / a[col * n + col];
            if factor == 0.0 {
                continue;
            }
            for k in col..n {
                a[row * n + k] -= factor * a[col * n + k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let tail: f64 = (row + 1..n).map(|k| a[row * n + k] * x[k]).sum();
        x[row] = (b[row] - tail) / a[row * n + row];
    }
    Some(x)
}

/// Ridge-regularized normal equations for `rows` of `features` → `targets`
pub(crate) fn least_squares(rows: &[Vec<f64>], targets: &[f64], ridge: f64) -> Option<Vec<f64>> {
    let n = rows.first()?.len();
    let mut ata = vec![0.0; n * n];
    let mut atb = vec![0.0; n];

    for (row, &y) in rows.iter().zip(targets) {
        for i in 0..n {
            atb[i] += row[i] * y;
            for j in 0..n {
                ata[i * n + j] += row[i] * row[j];
            }
        }
    }
    for i in 0..n {
        ata[i * n + i] += ridge;
    }
    solve(ata, atb)
}
