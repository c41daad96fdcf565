//! Per-particle passes. Every helper runs `f` once per element and returns only after all elements are done,
//! so consecutive passes never overlap.

pub use internal::*;

#[cfg(not(feature = "parallel"))]
mod internal {
    pub fn par_iter_reduce1<
        T1: Send + Sync,
        F: Fn(usize, &T1) -> X + Send + Sync,
        X: Send,
        C: Fn(X, X) -> X + Send + Sync,
        I: Fn() -> X + Send + Sync,
    >(
        arr1: &[T1],
        identity: I,
        combine: C,
        f: F,
    ) -> X {
        arr1.iter()
            .enumerate()
            .map(|(i, a)| f(i, a))
            .fold(identity(), |acc, value| combine(acc, value))
    }

    pub fn par_iter_mut1<T1: Send + Sync, F: Fn(usize, &mut T1) + Send + Sync>(arr1: &mut [T1], f: F) {
        arr1.iter_mut().enumerate().for_each(|(idx, v1)| {
            f(idx, v1);
        });
    }

    pub fn par_iter_mut2<T1: Send + Sync, T2: Send + Sync, F: Fn(usize, &mut T1, &mut T2) + Send + Sync>(
        arr1: &mut [T1],
        arr2: &mut [T2],
        f: F,
    ) {
        assert_eq!(arr1.len(), arr2.len());
        arr1.iter_mut()
            .zip(arr2.iter_mut())
            .enumerate()
            .for_each(|(idx, (v1, v2))| {
                f(idx, v1, v2);
            });
    }
}

#[cfg(feature = "parallel")]
mod internal {
    use rayon::prelude::*;

    pub fn par_iter_reduce1<
        T1: Send + Sync,
        F: Fn(usize, &T1) -> X + Send + Sync,
        X: Send,
        C: Fn(X, X) -> X + Send + Sync,
        I: Fn() -> X + Send + Sync,
    >(
        arr1: &[T1],
        identity: I,
        combine: C,
        f: F,
    ) -> X {
        arr1.par_iter()
            .enumerate()
            .map(|(i, a)| f(i, a))
            .reduce(identity, combine)
    }

    pub fn par_iter_mut1<T1: Send + Sync, F: Fn(usize, &mut T1) + Send + Sync>(arr1: &mut [T1], f: F) {
        arr1.par_iter_mut().enumerate().for_each(|(idx, v1)| {
            f(idx, v1);
        });
    }

    pub fn par_iter_mut2<T1: Send + Sync, T2: Send + Sync, F: Fn(usize, &mut T1, &mut T2) + Send + Sync>(
        arr1: &mut [T1],
        arr2: &mut [T2],
        f: F,
    ) {
        assert_eq!(arr1.len(), arr2.len());
        arr1.par_iter_mut()
            .zip(arr2.par_iter_mut())
            .enumerate()
            .for_each(|(idx, (v1, v2))| {
                f(idx, v1, v2);
            });
    }
}

#[test]
fn passes_visit_every_index_once() {
    let mut a = vec![0usize; 17];
    let mut b = vec![0usize; 17];
    par_iter_mut2(&mut a, &mut b, |i, x, y| {
        *x += i;
        *y += 2 * i;
    });
    assert_eq!(a, (0..17).collect::<Vec<_>>());
    assert_eq!(b, (0..17).map(|i| 2 * i).collect::<Vec<_>>());

    par_iter_mut1(&mut a, |i, x| *x -= i);
    assert!(a.iter().all(|&x| x == 0));

    let sum = par_iter_reduce1(&b, || 0, |x, y| x + y, |_, &v| v);
    assert_eq!(sum, 2 * (0..17).sum::<usize>());
}
