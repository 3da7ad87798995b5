//! GELU activation and its derivative, used by the MLP of every block.
//!
//! gelu(x) = 0.5 * x * (1 + tanh(sqrt(2/pi) * (x + 0.044715x^3)))
//! derivative from https://arxiv.org/pdf/1606.08415.pdf

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const COEFF: f32 = 0.044_715;

/// Compute the GELU activation for a single value.
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + COEFF * x.powi(3))).tanh())
}

/// Compute the derivative of GELU for a single value.
pub fn gelu_derivative(x: f32) -> f32 {
    let tanh_val = (SQRT_2_OVER_PI * (x + COEFF * x.powi(3))).tanh();
    let left = 0.5 * (1.0 + tanh_val);
    let right =
        0.5 * x * (1.0 - tanh_val.powi(2)) * SQRT_2_OVER_PI * (1.0 + 3.0 * COEFF * x.powi(2));
    left + right
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gelu_is_a_smooth_gate() {
        assert_eq!(gelu(0.0), 0.0);
        assert!((gelu(3.0) - 3.0).abs() < 0.01);
        assert!(gelu(-3.0).abs() < 0.01);
        // negative inputs leak a little, unlike ReLU
        assert!(gelu(-0.5) < 0.0);
    }

    #[test]
    fn derivative_matches_finite_difference() {
        let h = 1e-3;
        for x in [-2.5f32, -0.7, 0.0, 0.3, 1.9] {
            let numeric = (gelu(x + h) - gelu(x - h)) / (2.0 * h);
            assert!(
                (numeric - gelu_derivative(x)).abs() < 1e-3,
                "x={x}: {numeric} vs {}",
                gelu_derivative(x)
            );
        }
    }
}
