/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright (c) 2020-2022, Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

//! Small helpers shared by the runtime and the operators.

mod cache_padded;
mod device_type;

pub use cache_padded::CachePadded;
pub use device_type::DeviceType;
