//! Gesture input
//!
//! Turns pan, pinch and resize input into [`ViewportState`] mutations, and
//! produces inertial pan deltas after a fling.

use crate::viewport::ViewportState;

/// Input event from the host's gesture source
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GestureEvent {
    /// Drag by a screen-space delta
    Pan { dx: f32, dy: f32 },

    /// Multiply the scale by `factor`, keeping the screen point
    /// (`focal_x`, `focal_y`) fixed
    Zoom {
        factor: f32,
        focal_x: f32,
        focal_y: f32,
    },

    /// The surface changed size
    Resize { width: f32, height: f32 },
}

/// Allowed zoom range
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleLimits {
    pub min: f32,
    pub max: f32,
}

impl ScaleLimits {
    pub fn new(min: f32, max: f32) -> Self {
        Self {
            min: min.min(max),
            max: max.max(min),
        }
    }

    pub fn clamp(&self, scale: f32) -> f32 {
        scale.clamp(self.min, self.max)
    }
}

impl Default for ScaleLimits {
    fn default() -> Self {
        Self::new(0.1, 16.0)
    }
}

impl ViewportState {
    /// Apply one gesture. Returns `true` if the viewport changed.
    pub fn apply(&mut self, event: GestureEvent, limits: ScaleLimits) -> bool {
        let before = *self;
        match event {
            GestureEvent::Pan { dx, dy } => {
                if dx.is_finite() && dy.is_finite() {
                    self.pan_x += dx;
                    self.pan_y += dy;
                }
            }
            GestureEvent::Zoom {
                factor,
                focal_x,
                focal_y,
            } => {
                if factor.is_finite() && factor > 0.0 && self.scale > 0.0 {
                    let scale = limits.clamp(self.scale * factor);
                    let ratio = scale / self.scale;
                    self.pan_x = focal_x - (focal_x - self.pan_x) * ratio;
                    self.pan_y = focal_y - (focal_y - self.pan_y) * ratio;
                    self.scale = scale;
                }
            }
            GestureEvent::Resize { width, height } => {
                if width.is_finite() && height.is_finite() {
                    self.surface_width = width.max(0.0);
                    self.surface_height = height.max(0.0);
                }
            }
        }
        *self != before
    }
}

/// Inertial scrolling after a fling
///
/// Velocity decays exponentially; each [`step`](Self::step) yields the pan
/// delta for the elapsed time until the velocity drops below the stop
/// threshold.
#[derive(Debug, Clone, Copy)]
pub struct FlingAnimator {
    velocity_x: f32,
    velocity_y: f32,
    /// Exponential decay rate per second
    friction: f32,
    stop_velocity: f32,
}

impl FlingAnimator {
    /// Start a fling at (`velocity_x`, `velocity_y`) screen px per second
    pub fn new(velocity_x: f32, velocity_y: f32) -> Self {
        Self {
            velocity_x,
            velocity_y,
            friction: 4.0,
            stop_velocity: 5.0,
        }
    }

    pub fn with_friction(mut self, friction: f32) -> Self {
        self.friction = friction.max(0.0);
        self
    }

    pub fn with_stop_velocity(mut self, stop_velocity: f32) -> Self {
        self.stop_velocity = stop_velocity.max(0.0);
        self
    }

    pub fn velocity(&self) -> (f32, f32) {
        (self.velocity_x, self.velocity_y)
    }

    pub fn is_finished(&self) -> bool {
        self.velocity_x.hypot(self.velocity_y) < self.stop_velocity.max(f32::EPSILON)
    }

    /// Advance by `dt` seconds
    pub fn step(&mut self, dt: f32) -> Option<GestureEvent> {
        if self.is_finished() || dt.is_nan() || dt <= 0.0 {
            return None;
        }

        // Exact integral of v * e^(-k t) over the step
        let decay = (-self.friction * dt).exp();
        let travelled = if self.friction > 0.0 {
            (1.0 - decay) / self.friction
        } else {
            dt
        };
        let event = GestureEvent::Pan {
            dx: self.velocity_x * travelled,
            dy: self.velocity_y * travelled,
        };

        self.velocity_x *= decay;
        self.velocity_y *= decay;
        Some(event)
    }

    pub fn cancel(&mut self) {
        self.velocity_x = 0.0;
        self.velocity_y = 0.0;
    }
}
