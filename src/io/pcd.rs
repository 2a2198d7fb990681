//! Minimal ASCII PCD reader/writer for XYZ point clouds (spec.md §6
//! persisted layout: `lidar.pcd`, `edges_strong.pcd`, etc). No PCL
//! binding is available in this corpus, so clouds round-trip through
//! the plain-text PCD 0.7 format instead of the binary variant.

use std::io::{self, BufRead, Write};

use nalgebra::Point3;

pub fn write_pcd<W: Write>(mut out: W, points: &[Point3<f64>]) -> io::Result<()> {
    writeln!(out, "# .PCD v0.7 - Point Cloud Data file format")?;
    writeln!(out, "VERSION 0.7")?;
    writeln!(out, "FIELDS x y z")?;
    writeln!(out, "SIZE 4 4 4")?;
    writeln!(out, "TYPE F F F")?;
    writeln!(out, "COUNT 1 1 1")?;
    writeln!(out, "WIDTH {}", points.len())?;
    writeln!(out, "HEIGHT 1")?;
    writeln!(out, "VIEWPOINT 0 0 0 1 0 0 0")?;
    writeln!(out, "POINTS {}", points.len())?;
    writeln!(out, "DATA ascii")?;
    for p in points {
        writeln!(out, "{} {} {}", p.x as f32, p.y as f32, p.z as f32)?;
    }
    Ok(())
}

pub fn read_pcd<R: BufRead>(reader: R) -> io::Result<Vec<Point3<f64>>> {
    let mut points = Vec::new();
    let mut in_data = false;
    for line in reader.lines() {
        let line = line?;
        if in_data {
            let mut parts = line.split_whitespace();
            let (Some(x), Some(y), Some(z)) = (parts.next(), parts.next(), parts.next()) else {
                continue;
            };
            let (Ok(x), Ok(y), Ok(z)) = (x.parse::<f64>(), y.parse::<f64>(), z.parse::<f64>()) else {
                continue;
            };
            points.push(Point3::new(x, y, z));
            continue;
        }
        if line.starts_with("DATA") {
            in_data = true;
        }
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_points() {
        let points = vec![Point3::new(1.0, 2.0, 3.0), Point3::new(-0.5, 0.25, 9.0)];
        let mut buf = Vec::new();
        write_pcd(&mut buf, &points).unwrap();
        let parsed = read_pcd(io::Cursor::new(buf)).unwrap();
        assert_eq!(parsed.len(), points.len());
        for (a, b) in points.iter().zip(parsed.iter()) {
            assert!((a.x - b.x).abs() < 1e-5);
            assert!((a.y - b.y).abs() < 1e-5);
            assert!((a.z - b.z).abs() < 1e-5);
        }
    }

    #[test]
    fn empty_cloud_round_trips() {
        let mut buf = Vec::new();
        write_pcd(&mut buf, &[]).unwrap();
        let parsed = read_pcd(io::Cursor::new(buf)).unwrap();
        assert!(parsed.is_empty());
    }
}
