use rand::Rng;
use rand_distr::StandardNormal;

/// Standard deviation of the truncated normal used for weights, the
/// classification token and the positional embedding table.
pub const INIT_STD: f32 = 0.02;

/// A learnable tensor together with its gradient and AdamW moments.
///
/// Values are stored flat in row-major order; `shape` is kept for the
/// weights file and for shape checks on load.
#[derive(Debug, Clone)]
pub struct Param {
    pub shape: Vec<usize>,
    pub value: Vec<f32>,
    pub grad: Vec<f32>,
    // AdamW state
    pub m: Vec<f32>,
    pub v: Vec<f32>,
}

impl Param {
    pub fn from_values(shape: Vec<usize>, value: Vec<f32>) -> Self {
        let len = value.len();
        debug_assert_eq!(len, shape.iter().product::<usize>());
        Param {
            shape,
            value,
            grad: vec![0.0; len],
            m: vec![0.0; len],
            v: vec![0.0; len],
        }
    }

    pub fn filled(shape: Vec<usize>, fill: f32) -> Self {
        let len = shape.iter().product();
        Self::from_values(shape, vec![fill; len])
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::filled(shape, 0.0)
    }

    /// Truncated normal initialisation with mean 0 and std [`INIT_STD`].
    pub fn trunc_normal<R: Rng + ?Sized>(shape: Vec<usize>, rng: &mut R) -> Self {
        let len = shape.iter().product();
        let value = (0..len).map(|_| trunc_normal(rng, INIT_STD)).collect();
        Self::from_values(shape, value)
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn zero_grad(&mut self) {
        self.grad.iter_mut().for_each(|g| *g = 0.0);
    }
}

/// One draw from N(0, std^2) restricted to `[-2 std, 2 std]`.
pub fn trunc_normal<R: Rng + ?Sized>(rng: &mut R, std: f32) -> f32 {
    loop {
        let z: f32 = rng.sample(StandardNormal);
        if z.abs() <= 2.0 {
            return z * std;
        }
    }
}

/// Anything that owns named parameters.
///
/// Names are dot-separated paths (`blocks.0.attn.qkv.weight`) and double as
/// the keys of the weights file.
pub trait Parameters {
    fn named_params(&self, prefix: &str) -> Vec<(String, &Param)>;
    fn named_params_mut(&mut self, prefix: &str) -> Vec<(String, &mut Param)>;

    fn zero_grad(&mut self) {
        for (_, p) in self.named_params_mut("") {
            p.zero_grad();
        }
    }

    fn num_params(&self) -> usize {
        self.named_params("").iter().map(|(_, p)| p.len()).sum()
    }
}

/// Join a parameter path segment onto a prefix.
pub fn scoped(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}
