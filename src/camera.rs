//! Minimal render camera
//!
//! Holds the view/projection state the pipelines consume. Movement and input
//! handling live with the application; the renderer only needs matrices,
//! frustum planes and a dirty flag for pass-constant refresh.

use cgmath::{perspective, Deg, InnerSpace, Matrix4, Point3, SquareMatrix, Vector3};

pub struct Camera {
    pub position: Point3<f32>,
    pub target: Point3<f32>,
    pub up: Vector3<f32>,

    pub fovy_degrees: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,

    dirty: bool,
}

impl Camera {
    pub fn new(aspect: f32) -> Self {
        Self {
            position: Point3::new(0.0, 2.0, 10.0),
            target: Point3::new(0.0, 0.0, 0.0),
            up: Vector3::unit_y(),
            fovy_degrees: 45.0,
            aspect,
            near: 0.1,
            far: 1000.0,
            dirty: true,
        }
    }

    pub fn build_view_matrix(&self) -> Matrix4<f32> {
        Matrix4::look_at_rh(self.position, self.target, self.up)
    }

    /// Reversed-depth projection: near plane maps to depth 1.0, far to 0.0.
    /// Keeps depth precision near the camera and lets the occlusion pyramid
    /// use a min-reduction.
    pub fn build_projection_matrix(&self) -> Matrix4<f32> {
        let standard = perspective(Deg(self.fovy_degrees), self.aspect, self.near, self.far);
        reverse_depth() * standard
    }

    pub fn build_view_proj(&self) -> Matrix4<f32> {
        self.build_projection_matrix() * self.build_view_matrix()
    }

    pub fn view_direction(&self) -> Vector3<f32> {
        (self.target - self.position).normalize()
    }

    pub fn set_position(&mut self, position: Point3<f32>) {
        self.position = position;
        self.dirty = true;
    }

    pub fn set_target(&mut self, target: Point3<f32>) {
        self.target = target;
        self.dirty = true;
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        self.aspect = aspect;
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }
}

/// Remaps cgmath's GL-style clip z in [-1, 1] to wgpu's [0, 1], reversed so
/// the near plane lands at 1.0.
fn reverse_depth() -> Matrix4<f32> {
    let mut m = Matrix4::identity();
    m.z.z = -0.5;
    m.w.z = 0.5;
    m
}

/// Extract world-space frustum planes from a view-projection matrix.
/// Planes point inward; `dot(plane.xyz, p) + plane.w >= 0` means inside.
///
/// Clip space is reversed-depth: a point is inside when `0 <= z <= w`, so
/// the far plane is the raw z row and the near plane is `w - z`.
pub fn extract_frustum_planes(view_proj: &Matrix4<f32>) -> [[f32; 4]; 6] {
    // cgmath stores columns; row i of the matrix is (x[i], y[i], z[i], w[i]).
    let row = |i: usize| -> [f32; 4] {
        [view_proj.x[i], view_proj.y[i], view_proj.z[i], view_proj.w[i]]
    };
    let add = |a: [f32; 4], b: [f32; 4]| [a[0] + b[0], a[1] + b[1], a[2] + b[2], a[3] + b[3]];
    let sub = |a: [f32; 4], b: [f32; 4]| [a[0] - b[0], a[1] - b[1], a[2] - b[2], a[3] - b[3]];

    let (r0, r1, r2, r3) = (row(0), row(1), row(2), row(3));
    let mut planes = [
        add(r3, r0), // left:   w + x >= 0
        sub(r3, r0), // right:  w - x >= 0
        add(r3, r1), // bottom: w + y >= 0
        sub(r3, r1), // top:    w - y >= 0
        sub(r3, r2), // near:   w - z >= 0
        r2,          // far:    z >= 0
    ];

    // Normalize planes
    for plane in &mut planes {
        let length = (plane[0] * plane[0] + plane[1] * plane[1] + plane[2] * plane[2]).sqrt();
        if length > 0.0 {
            plane[0] /= length;
            plane[1] /= length;
            plane[2] /= length;
            plane[3] /= length;
        }
    }

    planes
}
