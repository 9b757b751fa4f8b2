use marten_core::{bail, Error, Float, Result, Tensor};

// Bilinear resize of feature-map stacks [maps, h, w]. This is the
// detector's per-resolution preprocessing step: every scale of the pyramid
// is a bilinear rescale of the full input image.

/// Resize each map of a [maps, h, w] tensor to oh×ow with bilinear
/// interpolation. Endpoints map to endpoints, so a same-size resize is the
/// identity.
pub fn resize_bilinear<T: Float>(src: &Tensor<T>, oh: usize, ow: usize) -> Result<Tensor<T>> {
    if src.order() != 3 {
        return Err(Error::OrderMismatch {
            expected: 3,
            got: src.order(),
        });
    }
    if oh == 0 || ow == 0 {
        bail!("resize_bilinear: degenerate target {}x{}", oh, ow);
    }
    let d = src.dims();
    let (maps, h, w) = (d[0], d[1], d[2]);
    let mut out = Tensor::new((maps, oh, ow))?;

    // Source position per output cell. With a single output cell the
    // ratio is 0/0; sample the origin.
    let fy = if oh > 1 {
        (h - 1) as f64 / (oh - 1) as f64
    } else {
        0.0
    };
    let fx = if ow > 1 {
        (w - 1) as f64 / (ow - 1) as f64
    } else {
        0.0
    };

    for m in 0..maps {
        let sv = src.select(0, m)?.to_vec();
        let mut ov = vec![T::ZERO; oh * ow];
        for i in 0..oh {
            let y = i as f64 * fy;
            let y0 = y.floor() as usize;
            let y1 = (y0 + 1).min(h - 1);
            let dy = y - y0 as f64;
            for j in 0..ow {
                let x = j as f64 * fx;
                let x0 = x.floor() as usize;
                let x1 = (x0 + 1).min(w - 1);
                let dx = x - x0 as f64;
                let v00 = sv[y0 * w + x0].to_f64();
                let v01 = sv[y0 * w + x1].to_f64();
                let v10 = sv[y1 * w + x0].to_f64();
                let v11 = sv[y1 * w + x1].to_f64();
                let top = v00 + (v01 - v00) * dx;
                let bottom = v10 + (v11 - v10) * dx;
                ov[i * ow + j] = T::from_f64(top + (bottom - top) * dy);
            }
        }
        out.select(0, m)?.assign(&ov)?;
    }
    Ok(out)
}
