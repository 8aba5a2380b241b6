use image::{Rgba, RgbaImage};
use slate::Frame;

/// Solid `fg` rectangle covering `[x0, x1) x [y0, y1)` on a `bg` background.
pub fn rect_frame(
    width: u32,
    height: u32,
    (x0, y0, x1, y1): (u32, u32, u32, u32),
    fg: [u8; 3],
    bg: [u8; 3],
) -> Frame {
    assert!(x0 < x1 && x1 <= width && y0 < y1 && y1 <= height, "rectangle must fit");
    let img = RgbaImage::from_fn(width, height, |x, y| {
        let c = if (x0..x1).contains(&x) && (y0..y1).contains(&y) {
            fg
        } else {
            bg
        };
        Rgba([c[0], c[1], c[2], 255])
    });
    Frame::new(img).expect("non-empty frame")
}

/// Flat frame with no structure at all.
pub fn blank_frame(width: u32, height: u32, value: u8) -> Frame {
    Frame::new(RgbaImage::from_pixel(width, height, Rgba([value, value, value, 255])))
        .expect("non-empty frame")
}
