/*
 * This Source Code Form is subject to the terms of the Mozilla Public License,
 * v. 2.0. If a copy of the MPL was not distributed with this file, You can
 * obtain one at http://mozilla.org/MPL/2.0/.
 *
 *
 * Copyright 2018-2022 Clemens Lutz
 * Author: Clemens Lutz <lutzcle@cml.li>
 */

pub mod allocator;
pub mod cancel;
pub mod dispatcher;
pub mod memory;
pub mod sync;
