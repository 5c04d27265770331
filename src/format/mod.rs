// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod aftl;
pub mod avb;
pub mod padding;
